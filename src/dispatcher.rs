//! Completion dispatcher with multi-key load balancing.
//!
//! [`Dispatcher::complete`] sends a transcript to the completion service,
//! picking a credential from the shared [`CredentialPool`] for every
//! attempt.
//!
//! # Retry policy
//!
//! - Rate limited (HTTP 429) → rotate to the next credential and retry.
//! - Any other failure → fail immediately, no retry.
//! - At most `2 × pool_size` attempts per call, then
//!   [`DispatchError::Exhausted`].
//! - After each full sweep of the pool the dispatcher pauses for
//!   `completion.retry_backoff_ms` before the next sweep.
//!
//! Every attempt consumes one rotation step, failed or not, so load stays
//! spread across the pool.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::completion::{CompletionClient, CompletionError, CompletionRequest};
use crate::config::CompletionConfig;
use crate::credentials::CredentialPool;
use crate::models::{ConversationTurn, Role};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("all credentials exhausted after {attempts} rate-limited attempts")]
    Exhausted { attempts: usize },
    #[error("completion timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("completion failed: {0}")]
    Upstream(String),
}

pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    client: Arc<dyn CompletionClient>,
    model: String,
    system_prompt: String,
    timeout: Duration,
    backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        client: Arc<dyn CompletionClient>,
        config: &CompletionConfig,
    ) -> Self {
        Self {
            pool,
            client,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Attempt budget for a single call.
    pub fn max_attempts(&self) -> usize {
        self.pool.len() * 2
    }

    /// Completes `transcript` and returns the assistant's reply text.
    ///
    /// The configured system prompt is prepended; any `system` turns in
    /// `transcript` are dropped.
    pub async fn complete(&self, transcript: &[ConversationTurn]) -> Result<String, DispatchError> {
        let request = self.build_request(transcript);
        let max_attempts = self.max_attempts();

        for attempt in 1..=max_attempts {
            let (index, credential) = self.pool.next();
            debug!(attempt, credential = index, "dispatching completion");

            let outcome =
                tokio::time::timeout(self.timeout, self.client.complete(credential, &request))
                    .await
                    .unwrap_or(Err(CompletionError::Timeout));

            match outcome {
                Ok(text) => return Ok(text),
                Err(CompletionError::RateLimited(detail)) => {
                    warn!(
                        attempt,
                        max_attempts,
                        credential = index,
                        detail = %detail,
                        "credential rate limited, rotating"
                    );
                    let sweep_done = attempt % self.pool.len() == 0;
                    if sweep_done && attempt < max_attempts && !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(CompletionError::Timeout) => {
                    return Err(DispatchError::Timeout {
                        secs: self.timeout.as_secs(),
                    })
                }
                Err(CompletionError::Upstream(detail)) => {
                    return Err(DispatchError::Upstream(detail))
                }
            }
        }

        Err(DispatchError::Exhausted {
            attempts: max_attempts,
        })
    }

    fn build_request(&self, transcript: &[ConversationTurn]) -> CompletionRequest {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        messages.push(ConversationTurn::system(self.system_prompt.clone()));
        messages.extend(
            transcript
                .iter()
                .filter(|turn| turn.role != Role::System)
                .cloned(),
        );
        CompletionRequest {
            model: self.model.clone(),
            messages,
        }
    }
}
