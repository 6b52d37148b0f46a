use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("transient collaborator failure: {0}")]
    Transient(String),
    #[error("collaborator quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("collaborator response rejected: {0}")]
    Validation(String),
    #[error("unusable input {path}: {reason}")]
    FatalInput { path: PathBuf, reason: String },
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl CollaboratorError {
    /// Transient failures and failed external commands may succeed on a
    /// later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Transient(_) | CollaboratorError::CommandFailure { .. }
        )
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, CollaboratorError::QuotaExceeded(_))
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CollaboratorError::Io {
            source,
            path: path.into(),
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => super::http::classify_status(status, error.to_string()),
            None if error.is_decode() => CollaboratorError::Validation(error.to_string()),
            None => CollaboratorError::Transient(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for CollaboratorError {
    fn from(error: serde_json::Error) -> Self {
        CollaboratorError::Validation(error.to_string())
    }
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;
