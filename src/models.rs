//! Core data types shared across the relay.
//!
//! These types form the data contract between the presentation layer
//! ([`crate::relay`]), the dispatcher, the session store and the sync
//! pipeline. None of them carry behavior beyond small accessors.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque identity of a chat user.
///
/// Messaging transports usually hand out numeric ids, HTTP callers often
/// send strings. Both deserialize into the same key so a user keeps one
/// session regardless of how the id was encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => UserId::from(n),
            Raw::Text(s) => UserId::from(s),
        })
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation transcript.
///
/// Serializes as `{"role": "...", "content": "..."}`, which is the wire
/// shape of OpenAI-compatible chat completion APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A file as stored in the remote repository.
///
/// `sha` is the hosting service's content hash. Updates must quote it so
/// the service can tell an update from a colliding create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub content: Vec<u8>,
    pub sha: Option<String>,
}

/// Canonical address of a destination repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoLocation {
    pub owner: String,
    pub name: String,
    pub html_url: String,
}

/// What happened to one file during synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FileOutcome {
    Created,
    Updated,
    Failed(String),
}

/// Per-file line of a [`SyncReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSync {
    /// Path relative to the working directory, `/`-separated.
    pub path: String,
    pub outcome: FileOutcome,
}

/// Result of a synchronization run.
///
/// A run that reaches the repository always produces a report, even when
/// some files failed. Callers inspect [`SyncReport::failed`] to decide
/// whether to tell the user about partial uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub location: RepoLocation,
    pub files: Vec<FileSync>,
}

impl SyncReport {
    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Created))
    }

    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Updated))
    }

    /// Files that could not be written.
    pub fn failed(&self) -> Vec<&FileSync> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Failed(_)))
            .collect()
    }

    pub fn uploaded(&self) -> usize {
        self.created() + self.updated()
    }

    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| pred(&f.outcome)).count()
    }
}
