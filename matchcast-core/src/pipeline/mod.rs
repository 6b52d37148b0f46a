mod assembler;
mod audio;
mod commentary;
mod error;
mod event_source;
mod manifest;
mod progress;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collaborator::{
    Detector, Generator, MixSettings, Muxer, PreparedSource, Synthesizer, TimingConstraints,
};
use crate::config::PipelineConfig;
use crate::interval::IntervalSplitter;
use crate::model::{Event, Segment, Utterance};
use crate::retry::RetryPolicy;
use crate::timecode::format_hms;

pub use assembler::{ChunkAssembler, PublicLocation};
pub use audio::{AudioReport, AudioStage, NarratedUtterance};
pub use commentary::{
    truncate_to_budget, CommentaryStage, Normalised, NormalisedDraft, Normaliser,
    PreviousUtterance,
};
pub use error::{PipelineError, PipelineResult};
pub use event_source::EventSource;
pub use manifest::{compute_sha256, ManifestArtifact, ManifestSegment, SessionManifest};
pub use progress::{chunk_progress, ProgressEvent};
pub use session::{new_session_id, public_url, PipelineSession, PipelineState, Reporter};

const FEED_CAPACITY: usize = 64;

/// Sends on a bounded channel unless the run is cancelled first. Returns
/// false when the value was not delivered.
pub(crate) async fn send_or_cancel<T>(
    sender: &mpsc::Sender<T>,
    value: T,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        result = sender.send(value) => result.is_ok(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub video: PathBuf,
    pub session_id: Option<String>,
    pub concat_final: Option<bool>,
}

impl RunRequest {
    pub fn new(video: impl Into<PathBuf>) -> Self {
        Self {
            video: video.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session_id: String,
    pub state: PipelineState,
    pub segments: Vec<Segment>,
    pub utterances: usize,
    pub events: usize,
    pub narrated_utterances: usize,
    pub final_video: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub warnings: usize,
}

enum StageOutput {
    Events(Vec<Event>),
    Utterances(Vec<Utterance>),
    Audio(AudioReport),
    Segments(Vec<Segment>),
}

#[derive(Default)]
struct StageOutputs {
    events: Vec<Event>,
    utterances: Vec<Utterance>,
    audio: AudioReport,
    segments: Vec<Segment>,
}

/// Wires the stages together for one request at a time.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    detector: Arc<dyn Detector>,
    generator: Arc<dyn Generator>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    muxer: Arc<dyn Muxer>,
    context: Option<String>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("synthesis", &self.synthesizer.is_some())
            .field("context", &self.context.is_some())
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        detector: Arc<dyn Detector>,
        generator: Arc<dyn Generator>,
        muxer: Arc<dyn Muxer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            detector,
            generator,
            synthesizer: None,
            muxer,
            context: None,
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Option<Arc<dyn Synthesizer>>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawns a run and hands back its feed and control handles.
    pub fn start(&self, request: RunRequest) -> PipelineRun {
        let session_id = request.session_id.clone().unwrap_or_else(new_session_id);
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CAPACITY);
        let (state_tx, state_rx) = watch::channel(PipelineState::Initializing);
        let cancel = CancellationToken::new();

        let driver = Driver {
            pipeline: self.clone(),
            request,
            session_id: session_id.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(driver.drive(feed_tx, state_tx));

        PipelineRun {
            events: feed_rx,
            handle: RunHandle {
                session_id,
                state: state_rx,
                cancel,
                task: handle,
            },
        }
    }
}

/// Control side of a run: state observation, cancellation and the final
/// summary.
#[derive(Debug)]
pub struct RunHandle {
    session_id: String,
    state: watch::Receiver<PipelineState>,
    cancel: CancellationToken,
    task: JoinHandle<PipelineResult<RunSummary>>,
}

impl RunHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> PipelineResult<RunSummary> {
        self.task.await?
    }
}

#[derive(Debug)]
pub struct PipelineRun {
    events: mpsc::Receiver<ProgressEvent>,
    handle: RunHandle,
}

impl PipelineRun {
    pub fn session_id(&self) -> &str {
        self.handle.session_id()
    }

    pub fn handle(&self) -> &RunHandle {
        &self.handle
    }

    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Splits into the ordered event stream and the control handle. Dropping
    /// the stream cancels the run.
    pub fn into_parts(self) -> (ReceiverStream<ProgressEvent>, RunHandle) {
        (ReceiverStream::new(self.events), self.handle)
    }

    /// Drains the feed to the end, then waits for the summary.
    pub async fn collect(mut self) -> (Vec<ProgressEvent>, PipelineResult<RunSummary>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, self.handle.wait().await)
    }
}

struct Driver {
    pipeline: Pipeline,
    request: RunRequest,
    session_id: String,
    cancel: CancellationToken,
}

impl Driver {
    async fn drive(
        self,
        feed: mpsc::Sender<ProgressEvent>,
        state: watch::Sender<PipelineState>,
    ) -> PipelineResult<RunSummary> {
        let reporter = Reporter::new(feed.clone(), self.cancel.clone());
        let watcher = self.watch_client(feed);
        let _stop_watcher = watcher.drop_guard();

        let config = Arc::clone(&self.pipeline.config);
        info!(session = %self.session_id, video = %self.request.video.display(), "pipeline starting");
        reporter.status("Starting commentary pipeline", 0).await;

        let session_dir = config.sessions_dir().join(&self.session_id);
        if let Err(source) = fs::create_dir_all(&session_dir).await {
            let err = PipelineError::Io {
                source,
                path: session_dir,
            };
            return self.fail(&reporter, &state, err).await;
        }

        reporter.status("Preparing video...", 5).await;
        let prepared = tokio::select! {
            _ = self.cancel.cancelled() => {
                session::transition(&state, PipelineState::Cancelled);
                return Ok(self.summary(PipelineState::Cancelled, StageOutputs::default(), &reporter));
            }
            prepared = self.pipeline.muxer.prepare_source(&self.request.video, &session_dir) => prepared,
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return self.fail(&reporter, &state, PipelineError::Source(err)).await,
        };
        let splitter = match IntervalSplitter::new(prepared.duration, config.intervals.window()) {
            Ok(splitter) => splitter,
            Err(err) => return self.fail(&reporter, &state, err.into()).await,
        };
        if prepared.added_silent_track {
            reporter
                .warning("Source has no audio track; added a silent one")
                .await;
        }
        reporter
            .status(
                format!("Video ready ({})", format_hms(prepared.duration)),
                15,
            )
            .await;

        let session = Arc::new(PipelineSession::new(
            self.session_id.clone(),
            session_dir,
            splitter.intervals(),
            splitter.expected_segments(),
            state,
        ));
        session.transition(PipelineState::Running);
        reporter
            .status(
                format!("Analyzing {} intervals", session.intervals().len()),
                15,
            )
            .await;

        let outputs = self.run_stages(&session, &prepared, &reporter).await;
        if self.cancel.is_cancelled() {
            session.transition(PipelineState::Cancelled);
            info!(session = %self.session_id, delivered = session.delivered(), "pipeline cancelled");
            return Ok(self.summary(PipelineState::Cancelled, outputs, &reporter));
        }
        session.transition(PipelineState::Draining);

        reporter.status("Finalizing video...", 95).await;
        let final_video = match self.concat_final(&session, &outputs.segments, &reporter).await {
            Some(result) => result,
            None => {
                session.transition(PipelineState::Cancelled);
                return Ok(self.summary(PipelineState::Cancelled, outputs, &reporter));
            }
        };

        let manifest = match self
            .write_manifest(&session, &prepared, &outputs, final_video.as_deref(), &reporter)
            .await
        {
            Ok(path) => Some(path),
            Err(err) => {
                reporter
                    .warning(format!("Could not write session manifest: {err}"))
                    .await;
                None
            }
        };

        session.transition(PipelineState::Complete);
        let final_url = final_video
            .as_deref()
            .map(|path| self.location().url_for(path));
        reporter
            .emit(ProgressEvent::complete(session.delivered(), final_url))
            .await;
        info!(
            session = %self.session_id,
            chunks = session.delivered(),
            warnings = reporter.warning_count(),
            "pipeline complete"
        );

        let mut summary = self.summary(PipelineState::Complete, outputs, &reporter);
        summary.final_video = final_video;
        summary.manifest = manifest;
        Ok(summary)
    }

    fn watch_client(&self, feed: mpsc::Sender<ProgressEvent>) -> CancellationToken {
        let stop = CancellationToken::new();
        let cancel = self.cancel.clone();
        let stopped = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = feed.closed() => {
                    if !stopped.is_cancelled() {
                        warn!("client disconnected, cancelling run");
                        cancel.cancel();
                    }
                }
                _ = stopped.cancelled() => {}
                _ = cancel.cancelled() => {}
            }
        });
        stop
    }

    fn location(&self) -> PublicLocation {
        PublicLocation {
            base_url: self.pipeline.config.paths.public_base_url.clone(),
            videos_dir: self.pipeline.config.videos_dir(),
        }
    }

    async fn run_stages(
        &self,
        session: &Arc<PipelineSession>,
        prepared: &PreparedSource,
        reporter: &Reporter,
    ) -> StageOutputs {
        let config = &self.pipeline.config;
        let capacity = config.pipeline.channel_capacity.max(1);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        let (utterance_tx, utterance_rx) = mpsc::channel(capacity);
        let (narration_tx, narration_rx) = mpsc::channel(capacity);

        let retry = RetryPolicy::new(&config.retry, config.pipeline.call_timeout());
        let mux_retry = retry
            .clone()
            .with_max_attempts(config.retry.mux_attempts)
            .with_call_timeout(config.pipeline.call_timeout().max(config.muxing.timeout()));
        let synthesizer = if config.synthesis.enabled {
            self.pipeline.synthesizer.clone()
        } else {
            None
        };

        let source = EventSource::new(
            Arc::clone(&self.pipeline.detector),
            prepared.clone(),
            retry.clone(),
            reporter.clone(),
            Arc::clone(session),
        );
        let commentary = CommentaryStage::new(
            Arc::clone(&self.pipeline.generator),
            retry.clone(),
            reporter.clone(),
            TimingConstraints::from(&config.commentary),
            prepared.duration,
            self.pipeline.context.clone(),
        );
        let audio = AudioStage::new(
            synthesizer,
            retry,
            reporter.clone(),
            config.synthesis.max_in_flight,
        );
        let assembler = ChunkAssembler::new(
            Arc::clone(&self.pipeline.muxer),
            prepared.clone(),
            Arc::clone(session),
            config.muxing.encoding_profile(),
            MixSettings {
                original_volume: config.muxing.original_volume,
                narration_delay: config.muxing.narration_delay(),
            },
            mux_retry,
            reporter.clone(),
            self.location(),
        );

        let mut stages: JoinSet<StageOutput> = JoinSet::new();
        let cancel = self.cancel.clone();
        stages.spawn(async move { StageOutput::Events(source.run(batch_tx, cancel).await) });
        let cancel = self.cancel.clone();
        stages.spawn(async move {
            StageOutput::Utterances(commentary.run(batch_rx, utterance_tx, cancel).await)
        });
        let cancel = self.cancel.clone();
        stages.spawn(async move {
            StageOutput::Audio(audio.run(utterance_rx, narration_tx, cancel).await)
        });
        let cancel = self.cancel.clone();
        stages.spawn(async move { StageOutput::Segments(assembler.run(narration_rx, cancel).await) });

        let mut outputs = StageOutputs::default();
        loop {
            let joined = tokio::select! {
                _ = self.cancel.cancelled() => break,
                joined = stages.join_next() => joined,
            };
            match joined {
                Some(Ok(output)) => outputs.absorb(output, session),
                Some(Err(err)) => {
                    error!(error = %err, "pipeline stage aborted");
                    reporter
                        .warning(format!("A pipeline stage stopped unexpectedly: {err}"))
                        .await;
                }
                None => break,
            }
        }

        if self.cancel.is_cancelled() {
            self.stop_stages(&mut stages, &mut outputs, session).await;
        }
        outputs
    }

    async fn stop_stages(
        &self,
        stages: &mut JoinSet<StageOutput>,
        outputs: &mut StageOutputs,
        session: &Arc<PipelineSession>,
    ) {
        let grace = self.pipeline.config.pipeline.cancel_grace();
        let drained = timeout(grace, async {
            while let Some(joined) = stages.join_next().await {
                if let Ok(output) = joined {
                    outputs.absorb(output, session);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = stages.len(), "stages still running after grace period, aborting");
            stages.shutdown().await;
        }
    }

    /// `Some(None)` when no final artifact was produced, `None` when the run
    /// was cancelled while concatenating.
    async fn concat_final(
        &self,
        session: &Arc<PipelineSession>,
        segments: &[Segment],
        reporter: &Reporter,
    ) -> Option<Option<PathBuf>> {
        let config = &self.pipeline.config;
        let enabled = self
            .request
            .concat_final
            .unwrap_or(config.pipeline.concat_final);
        if !enabled || segments.is_empty() {
            return Some(None);
        }

        let muxer = Arc::clone(&self.pipeline.muxer);
        let paths: Vec<PathBuf> = segments.iter().map(|segment| segment.path.clone()).collect();
        let list = session.directory().join("concat_list.txt");
        let output = config.final_dir().join(format!(
            "commentary_{}.{}",
            self.session_id, config.muxing.container
        ));
        let task = tokio::spawn(async move {
            muxer.concat(&paths, &list, &output).await.map(|()| output)
        });

        let joined = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            joined = task => joined,
        };
        match joined {
            Ok(Ok(path)) => {
                info!(output = %path.display(), "final video assembled");
                Some(Some(path))
            }
            Ok(Err(err)) => {
                reporter
                    .warning(format!("Final video concatenation failed: {err}"))
                    .await;
                Some(None)
            }
            Err(err) => {
                reporter
                    .warning(format!("Final video task failed: {err}"))
                    .await;
                Some(None)
            }
        }
    }

    async fn write_manifest(
        &self,
        session: &Arc<PipelineSession>,
        prepared: &PreparedSource,
        outputs: &StageOutputs,
        final_video: Option<&std::path::Path>,
        reporter: &Reporter,
    ) -> PipelineResult<PathBuf> {
        let config = &self.pipeline.config;
        let final_video = match final_video {
            Some(path) => Some(ManifestArtifact {
                path: path.to_path_buf(),
                url: self.location().url_for(path),
                sha256: compute_sha256(path).await?.0,
            }),
            None => None,
        };
        let manifest = SessionManifest {
            session_id: self.session_id.clone(),
            state: PipelineState::Complete,
            source: self.request.video.clone(),
            prepared_source: prepared.path.clone(),
            duration_seconds: prepared.duration.as_secs_f64(),
            window_seconds: config.intervals.window_seconds,
            encoding: config.muxing.encoding_profile(),
            intervals: session.intervals().to_vec(),
            events: outputs.events.clone(),
            utterances: outputs.utterances.clone(),
            segments: manifest::manifest_segments(&outputs.segments).await?,
            final_video,
            warnings: reporter.warning_count(),
            created_at: Utc::now(),
        };
        manifest::write_manifest(session.directory(), &manifest).await
    }

    async fn fail(
        &self,
        reporter: &Reporter,
        state: &watch::Sender<PipelineState>,
        err: PipelineError,
    ) -> PipelineResult<RunSummary> {
        error!(session = %self.session_id, error = %err, "pipeline failed");
        session::transition(state, PipelineState::Failed);
        reporter.emit(ProgressEvent::error(err.to_string())).await;
        Err(err)
    }

    fn summary(&self, state: PipelineState, outputs: StageOutputs, reporter: &Reporter) -> RunSummary {
        RunSummary {
            session_id: self.session_id.clone(),
            state,
            utterances: outputs.utterances.len(),
            events: outputs.events.len(),
            narrated_utterances: outputs.audio.synthesized,
            segments: outputs.segments,
            final_video: None,
            manifest: None,
            warnings: reporter.warning_count(),
        }
    }
}

impl StageOutputs {
    fn absorb(&mut self, output: StageOutput, session: &PipelineSession) {
        match output {
            StageOutput::Events(events) => {
                self.events = events;
                session.transition(PipelineState::Draining);
            }
            StageOutput::Utterances(utterances) => self.utterances = utterances,
            StageOutput::Audio(report) => self.audio = report,
            StageOutput::Segments(segments) => self.segments = segments,
        }
    }
}
