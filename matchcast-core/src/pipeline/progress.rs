use serde::{Deserialize, Serialize};

use crate::model::Segment;
use crate::timecode::format_hms;

/// One frame of the client-facing feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status {
        message: String,
        progress: u8,
    },
    ChunkReady {
        index: u64,
        url: String,
        start_time: String,
        end_time: String,
        progress: u8,
    },
    Complete {
        chunks: u64,
        final_video: String,
        progress: u8,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn status(message: impl Into<String>, progress: u8) -> Self {
        ProgressEvent::Status {
            message: message.into(),
            progress: progress.min(100),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ProgressEvent::Warning {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
        }
    }

    pub fn chunk_ready(segment: &Segment, progress: u8) -> Self {
        ProgressEvent::ChunkReady {
            index: segment.delivery_index,
            url: segment.url.clone(),
            start_time: format_hms(segment.start),
            end_time: format_hms(segment.end),
            progress: progress.min(100),
        }
    }

    pub fn complete(chunks: u64, final_video: Option<String>) -> Self {
        ProgressEvent::Complete {
            chunks,
            final_video: final_video.unwrap_or_default(),
            progress: 100,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Status { .. } => "status",
            ProgressEvent::ChunkReady { .. } => "chunk_ready",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Warning { .. } => "warning",
            ProgressEvent::Error { .. } => "error",
        }
    }

    pub fn progress(&self) -> Option<u8> {
        match self {
            ProgressEvent::Status { progress, .. }
            | ProgressEvent::ChunkReady { progress, .. }
            | ProgressEvent::Complete { progress, .. } => Some(*progress),
            ProgressEvent::Warning { .. } | ProgressEvent::Error { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }
        )
    }

    /// Newline-delimited JSON framing.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Server-sent events framing.
    pub fn to_sse_frame(&self) -> serde_json::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// Progress while chunks are delivered: 15 once the source is ready, then
/// linear in delivered / expected up to 95.
pub fn chunk_progress(delivered: u64, expected: usize) -> u8 {
    let expected = expected.max(1) as f64;
    let value = 15.0 + (delivered as f64 / expected) * 80.0;
    value.min(95.0) as u8
}
