//! Completion-service credential pool with round-robin selection.
//!
//! The pool holds N interchangeable API keys. Every dispatch attempt takes
//! the key under a shared cursor and advances it by one, wrapping at the
//! end. The cursor is shared by all concurrent callers, so the increment
//! and the wrap happen in a single atomic update.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ConfigError;

/// One opaque API key. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for building request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

pub struct CredentialPool {
    credentials: Vec<Credential>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    /// Builds a pool in insertion order. An empty pool is a startup error.
    pub fn new<I, S>(secrets: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let credentials: Vec<Credential> = secrets.into_iter().map(Credential::new).collect();
        if credentials.is_empty() {
            return Err(ConfigError::MissingCredential(
                "COMPLETION_API_KEYS or GROQ_API_KEY",
            ));
        }
        Ok(Self {
            credentials,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Always false; kept for the `len`/`is_empty` pair.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Returns the credential under the cursor with its index, then
    /// advances the cursor modulo the pool size.
    pub fn next(&self) -> (usize, &Credential) {
        let len = self.credentials.len();
        let index = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or_else(|current| current);
        (index, &self.credentials[index])
    }
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("len", &self.credentials.len())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}
