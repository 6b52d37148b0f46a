use std::path::PathBuf;

use thiserror::Error;

use crate::collaborator::CollaboratorError;
use crate::interval::IntervalError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source video rejected: {0}")]
    Source(CollaboratorError),
    #[error("invalid analysis intervals: {0}")]
    Interval(#[from] IntervalError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("stage task failed: {0}")]
    Stage(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(error: tokio::task::JoinError) -> Self {
        PipelineError::Stage(error.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
