use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{Interval, Segment};

use super::progress::{chunk_progress, ProgressEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Initializing,
    Running,
    Draining,
    Complete,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Complete | PipelineState::Failed | PipelineState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Initializing, Running) | (Initializing, Failed) => true,
            (Running, Draining) => true,
            (Draining, Complete) => true,
            (current, Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineState::Initializing => "INITIALIZING",
            PipelineState::Running => "RUNNING",
            PipelineState::Draining => "DRAINING",
            PipelineState::Complete => "COMPLETE",
            PipelineState::Failed => "FAILED",
            PipelineState::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// `<UTC timestamp>_<8 hex chars>`, sortable by creation time.
pub fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Public URL for a file under `videos_dir`, or its plain path otherwise.
pub fn public_url(base_url: &str, videos_dir: &Path, path: &Path) -> String {
    match path.strip_prefix(videos_dir) {
        Ok(relative) => {
            let relative = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            format!("{}/{}", base_url.trim_end_matches('/'), relative)
        }
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

/// Per-request state shared by the stages of one run.
#[derive(Debug)]
pub struct PipelineSession {
    id: String,
    directory: PathBuf,
    intervals: Vec<Interval>,
    expected_segments: usize,
    delivered: AtomicU64,
    state: watch::Sender<PipelineState>,
}

impl PipelineSession {
    pub fn new(
        id: impl Into<String>,
        directory: PathBuf,
        intervals: Vec<Interval>,
        expected_segments: usize,
        state: watch::Sender<PipelineState>,
    ) -> Self {
        Self {
            id: id.into(),
            directory,
            intervals,
            expected_segments: expected_segments.max(1),
            delivered: AtomicU64::new(0),
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn narration_dir(&self) -> PathBuf {
        self.directory.join("narration")
    }

    pub fn segment_path(&self, sequence_index: u64, container: &str) -> PathBuf {
        self.directory
            .join(format!("segment_{sequence_index:04}.{container}"))
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn expected_segments(&self) -> usize {
        self.expected_segments
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Claims the next delivery ordinal.
    pub fn next_delivery_index(&self) -> u64 {
        self.delivered.fetch_add(1, Ordering::SeqCst)
    }

    pub fn progress(&self) -> u8 {
        chunk_progress(self.delivered(), self.expected_segments)
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn transition(&self, next: PipelineState) -> bool {
        transition(&self.state, next)
    }
}

pub(crate) fn transition(state: &watch::Sender<PipelineState>, next: PipelineState) -> bool {
    let changed = state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    });
    if changed {
        debug!(state = %next, "pipeline state changed");
    }
    changed
}

/// Handle used by stages to publish into the client feed. A closed feed
/// means the client went away and cancels the run.
#[derive(Debug, Clone)]
pub struct Reporter {
    feed: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
    warnings: Arc<AtomicUsize>,
}

impl Reporter {
    pub fn new(feed: mpsc::Sender<ProgressEvent>, cancel: CancellationToken) -> Self {
        Self {
            feed,
            cancel,
            warnings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn emit(&self, event: ProgressEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let delivered = tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = self.feed.send(event) => result.is_ok(),
        };
        if !delivered && !self.cancel.is_cancelled() {
            warn!("progress feed closed by client, cancelling run");
            self.cancel.cancel();
        }
        delivered
    }

    pub async fn status(&self, message: impl Into<String>, progress: u8) -> bool {
        self.emit(ProgressEvent::status(message, progress)).await
    }

    pub async fn warning(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.warnings.fetch_add(1, Ordering::SeqCst);
        warn!(%message, "pipeline warning");
        self.emit(ProgressEvent::warning(message)).await
    }

    pub async fn chunk_ready(&self, segment: &Segment, progress: u8) -> bool {
        self.emit(ProgressEvent::chunk_ready(segment, progress)).await
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use PipelineState::*;
        assert!(Initializing.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Failed));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Complete));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Cancelled));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Failed));
    }

    #[test]
    fn session_counts_deliveries_and_tracks_state() {
        let (tx, rx) = watch::channel(PipelineState::Initializing);
        let session = PipelineSession::new("s1", PathBuf::from("/tmp/s1"), Vec::new(), 4, tx);
        assert_eq!(session.progress(), 15);
        assert_eq!(session.next_delivery_index(), 0);
        assert_eq!(session.next_delivery_index(), 1);
        assert_eq!(session.delivered(), 2);
        assert_eq!(session.progress(), 55);

        assert!(session.transition(PipelineState::Running));
        assert!(!session.transition(PipelineState::Complete));
        assert_eq!(*rx.borrow(), PipelineState::Running);
        assert_eq!(
            session.segment_path(3, "mp4"),
            PathBuf::from("/tmp/s1/segment_0003.mp4")
        );
    }

    #[test]
    fn urls_are_relative_to_videos_dir() {
        let url = public_url(
            "/videos/",
            Path::new("/srv/videos"),
            Path::new("/srv/videos/streaming/abc/segment_0000.mp4"),
        );
        assert_eq!(url, "/videos/streaming/abc/segment_0000.mp4");
        assert_eq!(
            public_url("/videos", Path::new("/srv/videos"), Path::new("/elsewhere/x.mp4")),
            "/elsewhere/x.mp4"
        );
    }

    #[test]
    fn session_ids_are_unique() {
        let first = new_session_id();
        let second = new_session_id();
        assert_ne!(first, second);
        assert_eq!(first.len(), "20260101_120000_".len() + 8);
    }

    #[tokio::test]
    async fn closed_feed_cancels_run() {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let reporter = Reporter::new(tx, cancel.clone());
        assert!(reporter.status("hello", 0).await);
        drop(rx);
        assert!(!reporter.warning("nobody listening").await);
        assert!(cancel.is_cancelled());
        assert_eq!(reporter.warning_count(), 1);
    }
}
