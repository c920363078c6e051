//! Chat completion client abstraction.
//!
//! Defines the [`CompletionClient`] trait the dispatcher calls once per
//! attempt, and [`OpenAiCompatClient`], which talks to any
//! OpenAI-compatible `POST {base_url}/chat/completions` endpoint (Groq by
//! default).
//!
//! # Error classification
//!
//! | Upstream signal | Result |
//! |-----------------|--------|
//! | HTTP 2xx with `choices[0].message.content` | `Ok(text)` |
//! | HTTP 429 | [`CompletionError::RateLimited`] |
//! | request timed out | [`CompletionError::Timeout`] |
//! | anything else | [`CompletionError::Upstream`] |
//!
//! Only `RateLimited` is retried, and only by rotating to another key.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::Credential;
use crate::models::ConversationTurn;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("completion request timed out")]
    Timeout,
    #[error("completion service error: {0}")]
    Upstream(String),
}

/// Body of a chat completion request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ConversationTurn>,
}

/// One completion call with one credential.
///
/// Implementations must not retry on their own; rotation and retry
/// belong to [`crate::dispatcher::Dispatcher`].
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<String, CompletionError>;
}

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Upstream(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<String, CompletionError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", credential.expose()))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout
                } else {
                    CompletionError::Upstream(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| CompletionError::Upstream(format!("invalid response body: {}", e)))?;
            return parse_completion_response(&json);
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return Err(CompletionError::RateLimited(body_text));
        }
        Err(CompletionError::Upstream(format!("{}: {}", status, body_text)))
    }
}

/// Extracts `choices[0].message.content`.
fn parse_completion_response(json: &serde_json::Value) -> Result<String, CompletionError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            CompletionError::Upstream("invalid response: missing choices[0].message.content".into())
        })
}
