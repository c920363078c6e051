//! Repository-hosting collaborator.
//!
//! [`RepoHost`] is the set of operations the sync pipeline consumes.
//! [`GitHubHost`] implements it against the GitHub REST API v3:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | `authenticated_login` | `GET /user` |
//! | `create_repository` | `POST /user/repos` |
//! | `get_repository` | `GET /repos/{owner}/{repo}` |
//! | `get_file` | `GET /repos/{owner}/{repo}/contents/{path}` |
//! | `put_file` | `PUT /repos/{owner}/{repo}/contents/{path}` |
//!
//! File contents travel base64-encoded. Creating a repository that
//! already exists is reported as [`HostError::Conflict`] so callers can
//! fall back to fetching it.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::models::{RemoteFile, RepoLocation};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("resource already exists: {0}")]
    Conflict(String),
    #[error("not found")]
    NotFound,
    #[error("hosting request timed out")]
    Timeout,
    #[error("hosting API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("hosting request failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Login of the identity the credential belongs to.
    async fn authenticated_login(&self) -> Result<String, HostError>;

    async fn create_repository(&self, name: &str, private: bool)
        -> Result<RepoLocation, HostError>;

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RepoLocation, HostError>;

    /// Current content of `path`, or `None` if the file does not exist.
    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<RemoteFile>, HostError>;

    /// Creates `path`, or updates it when `prior_sha` is given.
    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        content: &[u8],
        prior_sha: Option<&str>,
        message: &str,
    ) -> Result<(), HostError>;
}

pub struct GitHubHost {
    http: reqwest::Client,
    api_base: Url,
    token: String,
}

#[derive(Deserialize)]
struct UserBody {
    login: String,
}

#[derive(Deserialize)]
struct OwnerBody {
    login: String,
}

#[derive(Deserialize)]
struct RepoBody {
    name: String,
    html_url: String,
    owner: OwnerBody,
}

impl From<RepoBody> for RepoLocation {
    fn from(body: RepoBody) -> Self {
        RepoLocation {
            owner: body.owner.login,
            name: body.name,
            html_url: body.html_url,
        }
    }
}

#[derive(Deserialize)]
struct ContentBody {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
}

impl GitHubHost {
    pub fn new(api_base: &str, token: impl Into<String>, timeout: Duration) -> Result<Self, HostError> {
        let api_base = Url::parse(api_base).map_err(|e| HostError::Transport(e.to_string()))?;
        if api_base.cannot_be_a_base() {
            return Err(HostError::Transport(format!(
                "hosting api_base is not a base URL: {}",
                api_base
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relay-harness/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HostError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_base,
            token: token.into(),
        })
    }

    /// Joins `segments` onto the API base, percent-encoding each one.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn contents_url(&self, owner: &str, repo: &str, path: &str) -> Url {
        let segments = ["repos", owner, repo, "contents"]
            .into_iter()
            .chain(path.split('/').filter(|s| !s.is_empty()));
        self.endpoint(segments)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, HostError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status, message))
    }
}

fn transport_error(e: reqwest::Error) -> HostError {
    if e.is_timeout() {
        HostError::Timeout
    } else {
        HostError::Transport(e.to_string())
    }
}

/// Maps a non-success status. GitHub answers a duplicate repository
/// create with 422 and a "name already exists" message.
fn classify_status(status: StatusCode, message: String) -> HostError {
    match status {
        StatusCode::NOT_FOUND => HostError::NotFound,
        StatusCode::CONFLICT => HostError::Conflict(message),
        StatusCode::UNPROCESSABLE_ENTITY if message.contains("already exists") => {
            HostError::Conflict(message)
        }
        _ => HostError::Status {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl RepoHost for GitHubHost {
    async fn authenticated_login(&self) -> Result<String, HostError> {
        let url = self.endpoint(["user"]);
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        let user: UserBody = response.json().await.map_err(transport_error)?;
        Ok(user.login)
    }

    async fn create_repository(
        &self,
        name: &str,
        private: bool,
    ) -> Result<RepoLocation, HostError> {
        let url = self.endpoint(["user", "repos"]);
        let body = serde_json::json!({ "name": name, "private": private });
        let response = self
            .send(self.request(reqwest::Method::POST, url).json(&body))
            .await?;
        let repo: RepoBody = response.json().await.map_err(transport_error)?;
        Ok(repo.into())
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RepoLocation, HostError> {
        let url = self.endpoint(["repos", owner, name]);
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        let repo: RepoBody = response.json().await.map_err(transport_error)?;
        Ok(repo.into())
    }

    async fn get_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<RemoteFile>, HostError> {
        let url = self.contents_url(owner, repo, path);
        let response = match self.send(self.request(reqwest::Method::GET, url)).await {
            Ok(response) => response,
            Err(HostError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        // A directory listing comes back as a JSON array.
        let value: serde_json::Value = response.json().await.map_err(transport_error)?;
        if value.is_array() {
            return Err(HostError::Conflict(format!("{} is a directory", path)));
        }
        let body: ContentBody =
            serde_json::from_value(value).map_err(|e| HostError::Transport(e.to_string()))?;
        if body.kind != "file" {
            return Err(HostError::Conflict(format!("{} is a {}", path, body.kind)));
        }

        // GitHub wraps base64 at 60 columns.
        let encoded: String = body
            .content
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let content = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| HostError::Transport(format!("invalid base64 content: {}", e)))?;

        Ok(Some(RemoteFile {
            path: body.path,
            content,
            sha: Some(body.sha),
        }))
    }

    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        content: &[u8],
        prior_sha: Option<&str>,
        message: &str,
    ) -> Result<(), HostError> {
        let url = self.contents_url(owner, repo, path);
        let mut body = serde_json::json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
        });
        if let Some(sha) = prior_sha {
            body["sha"] = serde_json::Value::String(sha.to_string());
        }
        self.send(self.request(reqwest::Method::PUT, url).json(&body))
            .await?;
        Ok(())
    }
}
