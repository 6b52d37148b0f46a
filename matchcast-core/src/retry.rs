use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::collaborator::CollaboratorError;
use crate::config::RetrySection;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{label} failed after {attempts} attempts: {source}")]
    Exhausted {
        label: String,
        attempts: u32,
        source: CollaboratorError,
    },
    #[error("{label} rejected: {source}")]
    Rejected {
        label: String,
        attempts: u32,
        source: CollaboratorError,
    },
    #[error("{label} cancelled")]
    Cancelled { label: String },
}

impl RetryError {
    pub fn source_error(&self) -> Option<&CollaboratorError> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Rejected { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { .. } => None,
        }
    }

    pub fn is_quota(&self) -> bool {
        self.source_error()
            .map(CollaboratorError::is_quota)
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

pub type RetryResult<T> = std::result::Result<T, RetryError>;

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
}

/// Bounded exponential backoff shared by every stage. Only retryable
/// collaborator errors are retried; a call exceeding `call_timeout` counts
/// as a transient failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
    call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(section: &RetrySection, call_timeout: Duration) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms.max(section.base_delay_ms)),
            jitter: Duration::from_millis(section.jitter_ms),
            call_timeout,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Delay before attempt `attempt + 1`, for `attempt >= 1`.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = scaled.min(self.max_delay);
        if self.jitter.is_zero() {
            return capped;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        capped + Duration::from_millis(extra)
    }

    pub async fn run<F, Fut, T>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryResult<RetryOutcome<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { label: label.to_string() });
                }
                result = timeout(self.call_timeout, operation(attempt)) => result,
            };
            let error = match outcome {
                Ok(Ok(result)) => return Ok(RetryOutcome { result, attempts: attempt }),
                Ok(Err(error)) => error,
                Err(_) => CollaboratorError::Transient(format!(
                    "call timed out after {:?}",
                    self.call_timeout
                )),
            };
            if !error.is_retryable() {
                return Err(RetryError::Rejected {
                    label: label.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    label: label.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }
            let wait = self.compute_delay(attempt);
            warn!(attempt, wait = ?wait, stage = label, error = %error, "retrying collaborator call");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { label: label.to_string() });
                }
                _ = sleep(wait) => {}
            }
        }
    }
}
