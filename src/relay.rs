//! Presentation layer between the messaging collaborator and the core.
//!
//! [`Relay::handle`] takes one [`InboundEvent`] and always produces a
//! [`Reply`]. Failures are logged with their detail and turned into short
//! user-facing messages; raw errors never reach the user.
//!
//! | Event | Route |
//! |-------|-------|
//! | `/start`, `/help`, `/new` | command replies (`/new` clears the session) |
//! | text with upload intent | [`SyncPipeline`] on the pending archive |
//! | other text | [`Dispatcher`] with the session transcript |
//! | archive bytes or URL | [`ArchiveIntake`] |

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::completion::OpenAiCompatClient;
use crate::config::Config;
use crate::credentials::CredentialPool;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::hosting::GitHubHost;
use crate::intake::{ArchiveIntake, IngestedArchive, IntakeError};
use crate::intent::{Intent, IntentClassifier, KeywordClassifier};
use crate::models::{ConversationTurn, SyncReport, UserId};
use crate::sessions::SessionStore;
use crate::sync::{SyncError, SyncPipeline};

const WELCOME: &str = "Hi! Send me a message and I'll answer it. \
Send a ZIP archive and then say \"upload repo <name>\" to push it to GitHub. \
Type /help for more.";

const HELP: &str = "Commands:\n\
/start - introduction\n\
/help - this message\n\
/new - forget the conversation and any uploaded archive\n\n\
To publish a project: send a .zip file, then write \"upload repo my-project\".";

const GENERIC_FAILURE: &str = "Something went wrong on my side. Please try again in a moment.";

/// Number of failed paths listed in a partial-upload reply.
const LISTED_FAILURES: usize = 5;

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Text {
        user: UserId,
        text: String,
    },
    Archive {
        user: UserId,
        filename: String,
        bytes: Vec<u8>,
    },
    ArchiveUrl {
        user: UserId,
        filename: String,
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
}

impl Reply {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

enum ArchiveSource {
    Bytes(Vec<u8>),
    Url(String),
}

pub struct Relay {
    sessions: Arc<SessionStore>,
    dispatcher: Dispatcher,
    intake: ArchiveIntake,
    sync: Option<SyncPipeline>,
    classifier: Box<dyn IntentClassifier>,
}

impl Relay {
    pub fn new(
        sessions: Arc<SessionStore>,
        dispatcher: Dispatcher,
        intake: ArchiveIntake,
        sync: Option<SyncPipeline>,
        classifier: Box<dyn IntentClassifier>,
    ) -> Self {
        Self {
            sessions,
            dispatcher,
            intake,
            sync,
            classifier,
        }
    }

    /// Wires the default collaborators: the OpenAI-compatible completion
    /// client, GitHub hosting (only when `GITHUB_TOKEN` is set), and the
    /// keyword intent classifier.
    pub fn from_config(config: &Config) -> Result<Self> {
        let dispatcher = dispatcher_from_config(config)?;
        let sessions = Arc::new(SessionStore::new(&config.sessions));
        let intake = ArchiveIntake::new(config.intake.clone(), sessions.clone())
            .context("Failed to set up archive intake")?;

        let sync = sync_from_config(config)?;
        if sync.is_none() {
            warn!("GITHUB_TOKEN not set, repository uploads are disabled");
        }

        let classifier = Box::new(KeywordClassifier::from_config(&config.intent));
        Ok(Self::new(sessions, dispatcher, intake, sync, classifier))
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub async fn handle(&self, event: InboundEvent) -> Reply {
        match event {
            InboundEvent::Text { user, text } => self.handle_text(&user, &text).await,
            InboundEvent::Archive {
                user,
                filename,
                bytes,
            } => {
                self.handle_archive(&user, &filename, ArchiveSource::Bytes(bytes))
                    .await
            }
            InboundEvent::ArchiveUrl {
                user,
                filename,
                url,
            } => {
                self.handle_archive(&user, &filename, ArchiveSource::Url(url))
                    .await
            }
        }
    }

    async fn handle_text(&self, user: &UserId, text: &str) -> Reply {
        let text = text.trim();
        if text.is_empty() {
            return Reply::new("Send me a message or a ZIP archive.");
        }
        if text.starts_with('/') {
            return self.handle_command(user, text);
        }

        match self.classifier.classify(text) {
            Intent::Upload { repo_name } => self.handle_upload(user, &repo_name).await,
            Intent::Chat => self.handle_chat(user, text).await,
        }
    }

    fn handle_command(&self, user: &UserId, text: &str) -> Reply {
        // Group chats address commands as "/cmd@botname".
        let command = text
            .split_whitespace()
            .next()
            .and_then(|c| c.split('@').next())
            .unwrap_or(text);
        match command {
            "/start" => Reply::new(WELCOME),
            "/help" => Reply::new(HELP),
            "/new" => {
                let existed = self.sessions.clear(user);
                info!(user = %user, existed, "session cleared");
                Reply::new("Started a new conversation.")
            }
            _ => Reply::new("Unknown command. Type /help to see what I can do."),
        }
    }

    async fn handle_chat(&self, user: &UserId, text: &str) -> Reply {
        let mut transcript = self.sessions.get(user);
        transcript.push(ConversationTurn::user(text));

        match self.dispatcher.complete(&transcript).await {
            Ok(answer) => {
                self.sessions.record_exchange(user, text, &answer);
                Reply::new(answer)
            }
            Err(e) => {
                error!(user = %user, error = %e, "completion failed");
                match e {
                    DispatchError::Exhausted { .. } => Reply::new(
                        "I'm getting too many requests right now. Please try again in a minute.",
                    ),
                    DispatchError::Timeout { .. } | DispatchError::Upstream(_) => {
                        Reply::new(GENERIC_FAILURE)
                    }
                }
            }
        }
    }

    async fn handle_upload(&self, user: &UserId, repo_name: &str) -> Reply {
        match self.upload(user, repo_name).await {
            Ok(report) => Reply::new(describe_report(&report)),
            Err(e) => {
                warn!(user = %user, repo = repo_name, error = %e, "upload failed");
                Reply::new(match e {
                    SyncError::PreconditionMissing => {
                        "Send me a ZIP archive first, then ask me to upload it.".to_string()
                    }
                    SyncError::HostingDisabled => {
                        "Uploading to GitHub is not configured on this server.".to_string()
                    }
                    SyncError::InvalidRepoName(name) => format!(
                        "\"{}\" is not a valid repository name. Use up to 100 letters, digits, '.', '-' or '_'.",
                        name
                    ),
                    SyncError::InvalidPattern(_) | SyncError::RepoUnavailable(_) => {
                        "I couldn't create or open that repository. Please try again later."
                            .to_string()
                    }
                })
            }
        }
    }

    /// Checks both preconditions before touching the network.
    async fn upload(&self, user: &UserId, repo_name: &str) -> Result<SyncReport, SyncError> {
        let archive = self
            .sessions
            .pending_archive(user)
            .ok_or(SyncError::PreconditionMissing)?;
        let pipeline = self.sync.as_ref().ok_or(SyncError::HostingDisabled)?;
        let report = pipeline.synchronize(archive.path(), repo_name).await;
        archive.release();
        report
    }

    async fn handle_archive(&self, user: &UserId, filename: &str, source: ArchiveSource) -> Reply {
        match self.receive_archive(user, filename, source).await {
            Ok(archive) => Reply::new(format!(
                "Got {}: {} files extracted. Now tell me where to put it, e.g. \"upload repo my-project\".",
                filename, archive.files
            )),
            Err(e) => {
                warn!(user = %user, filename, error = %e, "archive rejected");
                Reply::new(match e {
                    IntakeError::UnsupportedType(_) => {
                        "I can only handle .zip archives. Please send a ZIP file."
                    }
                    IntakeError::TooLarge { .. } => {
                        "That archive is too large. Please send a smaller ZIP file."
                    }
                    IntakeError::SourceNotAllowed(_) => {
                        "I can't download archives from that address."
                    }
                    IntakeError::Corrupt(_) | IntakeError::Download(_) | IntakeError::Io(_) => {
                        "I couldn't read that archive. Please send it again."
                    }
                })
            }
        }
    }

    async fn receive_archive(
        &self,
        user: &UserId,
        filename: &str,
        source: ArchiveSource,
    ) -> Result<IngestedArchive, IntakeError> {
        ArchiveIntake::check_filename(filename)?;
        let bytes = match source {
            ArchiveSource::Bytes(bytes) => bytes,
            ArchiveSource::Url(url) => self.intake.fetch(&url).await?,
        };
        self.intake.ingest(user, bytes).await
    }
}

/// Dispatcher over the configured key pool and the OpenAI-compatible client.
pub fn dispatcher_from_config(config: &Config) -> Result<Dispatcher> {
    let pool = CredentialPool::new(config.credentials.completion_keys.iter().cloned())
        .context("No completion API keys configured")?;
    let client = OpenAiCompatClient::new(
        config.completion.base_url.clone(),
        Duration::from_secs(config.completion.timeout_secs),
    )
    .context("Failed to build completion client")?;
    Ok(Dispatcher::new(
        Arc::new(pool),
        Arc::new(client),
        &config.completion,
    ))
}

/// GitHub-backed sync pipeline, or `None` without a hosting token.
pub fn sync_from_config(config: &Config) -> Result<Option<SyncPipeline>> {
    let Some(token) = &config.credentials.hosting_token else {
        return Ok(None);
    };
    let timeout = Duration::from_secs(config.hosting.timeout_secs);
    let host = GitHubHost::new(&config.hosting.api_base, token.clone(), timeout)
        .context("Failed to build hosting client")?;
    let pipeline = SyncPipeline::new(Arc::new(host), &config.sync, config.hosting.private, timeout)
        .context("Invalid sync configuration")?;
    Ok(Some(pipeline))
}

pub fn describe_report(report: &SyncReport) -> String {
    let total = report.files.len();
    let uploaded = report.uploaded();
    let url = &report.location.html_url;

    if total == 0 {
        return format!("The archive was empty, so {} has no files yet.", url);
    }

    let failed = report.failed();
    if failed.is_empty() {
        return format!("Uploaded {} files to {}", uploaded, url);
    }

    let mut listed: Vec<&str> = failed
        .iter()
        .take(LISTED_FAILURES)
        .map(|f| f.path.as_str())
        .collect();
    if failed.len() > LISTED_FAILURES {
        listed.push("...");
    }
    format!(
        "Uploaded {} of {} files to {}. Failed: {}",
        uploaded,
        total,
        url,
        listed.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionClient, CompletionError, CompletionRequest};
    use crate::config::{CompletionConfig, IntakeConfig, IntentConfig, SessionsConfig, SyncConfig};
    use crate::credentials::Credential;
    use crate::hosting::{HostError, RepoHost};
    use crate::intake::tests::zip_bytes;
    use crate::models::{FileOutcome, FileSync, RemoteFile, RepoLocation, Role};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replies with the number of turns it received, or with a fixed error.
    struct CountingClient {
        fail_with: Option<CompletionError>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionClient for CountingClient {
        async fn complete(
            &self,
            _credential: &Credential,
            request: &CompletionRequest,
        ) -> Result<String, CompletionError> {
            self.requests.lock().unwrap().push(request.clone());
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(format!("{} turns", request.messages.len())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RepoHost for RecordingHost {
        async fn authenticated_login(&self) -> Result<String, HostError> {
            self.calls.lock().unwrap().push("login".into());
            Ok("octo".into())
        }

        async fn create_repository(
            &self,
            name: &str,
            _private: bool,
        ) -> Result<RepoLocation, HostError> {
            self.calls.lock().unwrap().push(format!("create {}", name));
            Ok(RepoLocation {
                owner: "octo".into(),
                name: name.into(),
                html_url: format!("https://github.com/octo/{}", name),
            })
        }

        async fn get_repository(&self, _owner: &str, _name: &str) -> Result<RepoLocation, HostError> {
            Err(HostError::NotFound)
        }

        async fn get_file(
            &self,
            _owner: &str,
            _repo: &str,
            _path: &str,
        ) -> Result<Option<RemoteFile>, HostError> {
            Ok(None)
        }

        async fn put_file(
            &self,
            _owner: &str,
            _repo: &str,
            path: &str,
            _content: &[u8],
            _prior_sha: Option<&str>,
            _message: &str,
        ) -> Result<(), HostError> {
            self.calls.lock().unwrap().push(format!("put {}", path));
            Ok(())
        }
    }

    struct Harness {
        relay: Relay,
        client: Arc<CountingClient>,
        host: Arc<RecordingHost>,
        _work: TempDir,
    }

    fn harness(fail_with: Option<CompletionError>, hosting: bool) -> Harness {
        let work = TempDir::new().unwrap();
        let client = Arc::new(CountingClient {
            fail_with,
            requests: Mutex::new(Vec::new()),
        });
        let host = Arc::new(RecordingHost::default());

        let pool = Arc::new(CredentialPool::new(["k1", "k2"]).unwrap());
        let completion = CompletionConfig {
            retry_backoff_ms: 0,
            ..CompletionConfig::default()
        };
        let dispatcher = Dispatcher::new(pool, client.clone(), &completion);
        let sessions = Arc::new(SessionStore::new(&SessionsConfig::default()));
        let intake = ArchiveIntake::new(
            IntakeConfig {
                work_root: Some(work.path().to_path_buf()),
                ..IntakeConfig::default()
            },
            sessions.clone(),
        )
        .unwrap();
        let sync = hosting.then(|| {
            SyncPipeline::new(
                host.clone(),
                &SyncConfig::default(),
                true,
                Duration::from_secs(5),
            )
            .unwrap()
        });
        let classifier = Box::new(KeywordClassifier::from_config(&IntentConfig::default()));

        Harness {
            relay: Relay::new(sessions, dispatcher, intake, sync, classifier),
            client,
            host,
            _work: work,
        }
    }

    fn text(user: &str, text: &str) -> InboundEvent {
        InboundEvent::Text {
            user: UserId::new(user),
            text: text.to_string(),
        }
    }

    fn archive(user: &str, filename: &str, bytes: Vec<u8>) -> InboundEvent {
        InboundEvent::Archive {
            user: UserId::new(user),
            filename: filename.to_string(),
            bytes,
        }
    }

    #[tokio::test]
    async fn chat_carries_transcript_between_messages() {
        let h = harness(None, true);

        let first = h.relay.handle(text("u1", "hello")).await;
        let second = h.relay.handle(text("u1", "again")).await;

        // system + user, then system + user + assistant + user
        assert_eq!(first.text, "2 turns");
        assert_eq!(second.text, "4 turns");
        let requests = h.client.requests.lock().unwrap();
        let last = &requests[1].messages;
        assert_eq!(last[0].role, Role::System);
        assert_eq!(last[2], ConversationTurn::assistant("2 turns"));
        assert_eq!(h.relay.sessions().get(&UserId::new("u1")).len(), 4);
    }

    #[tokio::test]
    async fn failed_completion_leaves_transcript_untouched() {
        let h = harness(Some(CompletionError::Upstream("boom".into())), true);

        let reply = h.relay.handle(text("u1", "hello")).await;

        assert_eq!(reply.text, GENERIC_FAILURE);
        assert!(!reply.text.contains("boom"));
        assert!(h.relay.sessions().get(&UserId::new("u1")).is_empty());
    }

    #[tokio::test]
    async fn exhausted_pool_gets_busy_reply() {
        let h = harness(Some(CompletionError::RateLimited("429".into())), true);

        let reply = h.relay.handle(text("u1", "hello")).await;

        assert!(reply.text.contains("too many requests"));
        assert_eq!(h.client.requests.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn upload_without_archive_needs_no_network() {
        let h = harness(None, true);

        let reply = h.relay.handle(text("u1", "upload repo demo")).await;

        assert!(reply.text.contains("ZIP archive first"));
        assert!(h.host.calls.lock().unwrap().is_empty());
        assert!(h.client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_without_hosting_is_disabled() {
        let h = harness(None, false);
        h.relay
            .handle(archive("u1", "site.zip", zip_bytes(&[("a.txt", "a")])))
            .await;

        let reply = h.relay.handle(text("u1", "upload repo demo")).await;

        assert!(reply.text.contains("not configured"));
    }

    #[tokio::test]
    async fn archive_then_upload_pushes_files() {
        let h = harness(None, true);

        let received = h
            .relay
            .handle(archive(
                "u1",
                "Site.ZIP",
                zip_bytes(&[("index.html", "<h1>hi</h1>"), ("css/site.css", "body{}")]),
            ))
            .await;
        assert!(received.text.contains("2 files extracted"));

        let reply = h.relay.handle(text("u1", "upload repo demo")).await;

        assert_eq!(reply.text, "Uploaded 2 files to https://github.com/octo/demo");
        let calls = h.host.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec!["login", "create demo", "put css/site.css", "put index.html"]
        );
    }

    #[tokio::test]
    async fn non_zip_and_corrupt_uploads_are_refused() {
        let h = harness(None, true);

        let wrong_type = h
            .relay
            .handle(archive("u1", "notes.txt", b"hello".to_vec()))
            .await;
        let corrupt = h
            .relay
            .handle(archive("u1", "broken.zip", b"not a zip".to_vec()))
            .await;

        assert!(wrong_type.text.contains("only handle .zip"));
        assert!(corrupt.text.contains("send it again"));
        assert!(h.relay.sessions().pending_archive(&UserId::new("u1")).is_none());
    }

    #[tokio::test]
    async fn archive_url_from_unlisted_host_is_refused() {
        let h = harness(None, true);

        let reply = h
            .relay
            .handle(InboundEvent::ArchiveUrl {
                user: UserId::new("u1"),
                filename: "site.zip".to_string(),
                url: "http://169.254.169.254/latest/site.zip".to_string(),
            })
            .await;

        assert!(reply.text.contains("can't download"));
        assert!(h.relay.sessions().pending_archive(&UserId::new("u1")).is_none());
    }

    #[tokio::test]
    async fn new_command_clears_session() {
        let h = harness(None, true);
        let user = UserId::new("u1");
        h.relay.handle(text("u1", "hello")).await;
        h.relay
            .handle(archive("u1", "a.zip", zip_bytes(&[("a.txt", "a")])))
            .await;

        let reply = h.relay.handle(text("u1", "/new@relay_bot")).await;

        assert_eq!(reply.text, "Started a new conversation.");
        assert!(h.relay.sessions().get(&user).is_empty());
        assert!(h.relay.sessions().pending_archive(&user).is_none());
    }

    #[tokio::test]
    async fn unknown_commands_get_a_hint() {
        let h = harness(None, true);
        assert_eq!(h.relay.handle(text("u1", "/start")).await.text, WELCOME);
        let reply = h.relay.handle(text("u1", "/frobnicate")).await;
        assert!(reply.text.contains("/help"));
        assert!(h.client.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn partial_upload_lists_failures() {
        let location = RepoLocation {
            owner: "octo".into(),
            name: "demo".into(),
            html_url: "https://github.com/octo/demo".into(),
        };
        let report = SyncReport {
            location,
            files: vec![
                FileSync {
                    path: "a.txt".into(),
                    outcome: FileOutcome::Created,
                },
                FileSync {
                    path: "big.bin".into(),
                    outcome: FileOutcome::Failed("too large".into()),
                },
            ],
        };
        assert_eq!(
            describe_report(&report),
            "Uploaded 1 of 2 files to https://github.com/octo/demo. Failed: big.bin"
        );
    }
}
