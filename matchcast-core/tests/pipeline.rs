use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_stream::StreamExt;

use matchcast_core::collaborator::{
    CollaboratorError, CollaboratorResult, Detector, GenerationRequest, Generator, MuxRequest,
    Muxer, PreparedSource, SynthesizedAudio, Synthesizer,
};
use matchcast_core::config::{load_pipeline_config, PipelineConfig};
use matchcast_core::model::{AudioFormat, Event, Interval, Speaker, UtteranceDraft};
use matchcast_core::pipeline::{
    Pipeline, PipelineError, PipelineState, ProgressEvent, RunRequest, RunSummary,
};

fn fixture_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join(relative)
}

fn test_config(base: &TempDir) -> PipelineConfig {
    let mut config = load_pipeline_config(fixture_path("configs/matchcast.toml")).unwrap();
    config.paths.base_dir = base.path().to_string_lossy().to_string();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter_ms = 0;
    config.pipeline.call_timeout_seconds = 5;
    config.pipeline.cancel_grace_seconds = 1;
    config
}

fn interval_from_text(text: &str) -> usize {
    text.trim_end_matches('.')
        .rsplit(' ')
        .next()
        .and_then(|value| value.parse().ok())
        .unwrap()
}

#[derive(Default)]
struct StubDetector {
    failing_interval: Option<usize>,
    calls: Mutex<Vec<Interval>>,
}

#[async_trait]
impl Detector for StubDetector {
    async fn detect(
        &self,
        _source: &PreparedSource,
        interval: &Interval,
    ) -> CollaboratorResult<Vec<Event>> {
        self.calls.lock().unwrap().push(*interval);
        if self.failing_interval == Some(interval.index) {
            return Err(CollaboratorError::Transient("model overloaded".into()));
        }
        Ok(vec![Event {
            timestamp: interval.start + Duration::from_secs(1),
            description: format!("Chance in interval {}", interval.index),
            players: vec!["#9".into()],
            is_replay: false,
            intensity: 6,
            interval: interval.index,
        }])
    }
}

/// One utterance per batch, spanning most of the interval.
#[derive(Default)]
struct StubGenerator {
    requests: Mutex<Vec<GenerationRequest>>,
}

#[async_trait]
impl Generator for StubGenerator {
    async fn generate(&self, request: &GenerationRequest) -> CollaboratorResult<Vec<UtteranceDraft>> {
        self.requests.lock().unwrap().push(request.clone());
        let start = request.interval.start.as_secs() + 2;
        let end = request.interval.start.as_secs() + 28;
        let speaker = if request.interval.index % 2 == 0 {
            "COMMENTATOR_1"
        } else {
            "COMMENTATOR_2"
        };
        Ok(vec![UtteranceDraft {
            start_time: format!("{start}"),
            end_time: format!("{end}"),
            text: format!("What a moment in interval {}.", request.interval.index),
            speaker: speaker.into(),
        }])
    }
}

#[derive(Default)]
struct StubSynthesizer {
    quota_intervals: HashSet<usize>,
    panicking_intervals: HashSet<usize>,
    reverse_latency: bool,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Synthesizer for StubSynthesizer {
    async fn synthesize(&self, text: &str, speaker: Speaker) -> CollaboratorResult<SynthesizedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let interval = interval_from_text(text);
        if self.quota_intervals.contains(&interval) {
            return Err(CollaboratorError::QuotaExceeded("character quota exhausted".into()));
        }
        if self.panicking_intervals.contains(&interval) {
            panic!("voice model crashed on interval {interval}");
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let delay = if self.reverse_latency {
            Duration::from_millis(20 * (10u64.saturating_sub(interval as u64)))
        } else {
            self.latency
        };
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(SynthesizedAudio {
            bytes: format!("{speaker}:{text}").into_bytes(),
            format: AudioFormat::Mp3,
        })
    }
}

#[derive(Default)]
struct StubMuxer {
    duration: Duration,
    fatal: bool,
    failing_narrated: HashSet<u64>,
    failing_plain: HashSet<u64>,
    mux_delay: Duration,
    requests: Mutex<Vec<MuxRequest>>,
    concats: AtomicUsize,
}

impl StubMuxer {
    fn with_duration(seconds: u64) -> Self {
        Self {
            duration: Duration::from_secs(seconds),
            ..Self::default()
        }
    }

    fn segment_index(request: &MuxRequest) -> u64 {
        let stem = request.output.file_stem().unwrap().to_string_lossy().to_string();
        stem.trim_start_matches("segment_").parse().unwrap()
    }
}

#[async_trait]
impl Muxer for StubMuxer {
    async fn prepare_source(&self, video: &Path, _scratch_dir: &Path) -> CollaboratorResult<PreparedSource> {
        if self.fatal {
            return Err(CollaboratorError::FatalInput {
                path: video.to_path_buf(),
                reason: "no video stream".into(),
            });
        }
        Ok(PreparedSource {
            path: video.to_path_buf(),
            duration: self.duration,
            added_silent_track: false,
        })
    }

    async fn mux(&self, request: &MuxRequest) -> CollaboratorResult<()> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.mux_delay.is_zero() {
            tokio::time::sleep(self.mux_delay).await;
        }
        let index = Self::segment_index(request);
        let failing = if request.narration.is_some() {
            &self.failing_narrated
        } else {
            &self.failing_plain
        };
        if failing.contains(&index) {
            return Err(CollaboratorError::CommandFailure {
                command: "ffmpeg".into(),
                status: Some(1),
                stderr: "Conversion failed!".into(),
            });
        }
        let body = format!(
            "{:?}|{:?}|{}|{}",
            request.start,
            request.end,
            request.narration.is_some(),
            request.encoding.video_codec
        );
        std::fs::write(&request.output, body)
            .map_err(|source| CollaboratorError::io(&request.output, source))
    }

    async fn concat(&self, segments: &[PathBuf], list_path: &Path, output: &Path) -> CollaboratorResult<()> {
        self.concats.fetch_add(1, Ordering::SeqCst);
        std::fs::write(list_path, format!("{} segments", segments.len()))
            .map_err(|source| CollaboratorError::io(list_path, source))?;
        std::fs::create_dir_all(output.parent().unwrap())
            .map_err(|source| CollaboratorError::io(output, source))?;
        let mut joined = Vec::new();
        for segment in segments {
            joined.extend(std::fs::read(segment).map_err(|source| CollaboratorError::io(segment, source))?);
        }
        std::fs::write(output, joined).map_err(|source| CollaboratorError::io(output, source))
    }
}

struct Harness {
    detector: Arc<StubDetector>,
    generator: Arc<StubGenerator>,
    synthesizer: Arc<StubSynthesizer>,
    muxer: Arc<StubMuxer>,
}

impl Harness {
    fn new(muxer: StubMuxer) -> Self {
        Self {
            detector: Arc::new(StubDetector::default()),
            generator: Arc::new(StubGenerator::default()),
            synthesizer: Arc::new(StubSynthesizer::default()),
            muxer: Arc::new(muxer),
        }
    }

    fn pipeline(&self, config: PipelineConfig) -> Pipeline {
        Pipeline::new(
            config,
            self.detector.clone(),
            self.generator.clone(),
            self.muxer.clone(),
        )
        .with_synthesizer(Some(self.synthesizer.clone()))
    }
}

async fn run_to_end(pipeline: &Pipeline) -> (Vec<ProgressEvent>, RunSummary) {
    let (events, summary) = pipeline.start(RunRequest::new("/media/match.mp4")).collect().await;
    (events, summary.unwrap())
}

fn chunk_indices(events: &[ProgressEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::ChunkReady { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

fn warnings(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Warning { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn complete_chunks(events: &[ProgressEvent]) -> Option<(u64, String)> {
    events.iter().find_map(|event| match event {
        ProgressEvent::Complete {
            chunks,
            final_video,
            ..
        } => Some((*chunks, final_video.clone())),
        _ => None,
    })
}

#[tokio::test]
async fn detection_walks_intervals_in_order_with_truncated_tail() {
    let base = TempDir::new().unwrap();
    let harness = Harness::new(StubMuxer::with_duration(133));
    let (events, summary) = run_to_end(&harness.pipeline(test_config(&base))).await;

    let bounds: Vec<(u64, u64)> = harness
        .detector
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|interval| (interval.start.as_secs(), interval.end.as_secs()))
        .collect();
    assert_eq!(bounds, vec![(0, 30), (30, 60), (60, 90), (90, 120), (120, 133)]);
    assert_eq!(summary.state, PipelineState::Complete);
    assert_eq!(summary.segments.len(), 5);

    let last = summary.segments.last().unwrap();
    assert_eq!(last.start, Duration::from_secs(122));
    assert_eq!(last.end, Duration::from_secs(133));

    assert_eq!(events.first().and_then(ProgressEvent::progress), Some(0));
    assert_eq!(events.last().map(ProgressEvent::kind), Some("complete"));
    assert!(events.iter().any(|event| matches!(
        event,
        ProgressEvent::Status { message, .. } if message == "Analyzed interval 5/5 (1 events)"
    )));
    let preparation: Vec<(String, u8)> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Status { message, progress } => Some((message.clone(), *progress)),
            _ => None,
        })
        .take(4)
        .collect();
    assert_eq!(
        preparation,
        vec![
            ("Starting commentary pipeline".to_string(), 0),
            ("Preparing video...".to_string(), 5),
            ("Video ready (00:02:13)".to_string(), 15),
            ("Analyzing 5 intervals".to_string(), 15),
        ]
    );
    assert!(!events.iter().any(|event| event.kind() == "error"));
}

#[tokio::test]
async fn quota_failure_yields_segment_with_original_audio_only() {
    let base = TempDir::new().unwrap();
    let mut harness = Harness::new(StubMuxer::with_duration(120));
    harness.synthesizer = Arc::new(StubSynthesizer {
        quota_intervals: HashSet::from([2]),
        ..StubSynthesizer::default()
    });
    let (events, summary) = run_to_end(&harness.pipeline(test_config(&base))).await;

    assert_eq!(summary.segments.len(), 4);
    let narrated: Vec<bool> = summary.segments.iter().map(|s| s.narrated).collect();
    assert_eq!(narrated, vec![true, true, false, true]);
    assert!(warnings(&events)
        .iter()
        .any(|message| message.contains("utterance 2") && message.contains("quota")));
    assert_eq!(complete_chunks(&events).map(|(chunks, _)| chunks), Some(4));

    let requests = harness.muxer.requests.lock().unwrap();
    let for_two: Vec<&MuxRequest> = requests
        .iter()
        .filter(|request| StubMuxer::segment_index(request) == 2)
        .collect();
    assert_eq!(for_two.len(), 1);
    assert!(for_two[0].narration.is_none());
    // Quota errors are not retried.
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn synthesis_panic_does_not_hold_back_later_chunks() {
    let base = TempDir::new().unwrap();
    let mut harness = Harness::new(StubMuxer::with_duration(120));
    harness.synthesizer = Arc::new(StubSynthesizer {
        panicking_intervals: HashSet::from([1]),
        latency: Duration::from_millis(5),
        ..StubSynthesizer::default()
    });
    let (events, summary) = run_to_end(&harness.pipeline(test_config(&base))).await;

    assert_eq!(summary.state, PipelineState::Complete);
    assert_eq!(chunk_indices(&events), vec![0, 1, 2, 3]);
    let narrated: Vec<bool> = summary.segments.iter().map(|s| s.narrated).collect();
    assert_eq!(narrated, vec![true, false, true, true]);
    assert!(warnings(&events)
        .iter()
        .any(|message| message.contains("utterance 1 (synthesis task failed)")));
}

#[tokio::test]
async fn failed_interval_is_skipped_after_three_attempts() {
    let base = TempDir::new().unwrap();
    let mut harness = Harness::new(StubMuxer::with_duration(150));
    harness.detector = Arc::new(StubDetector {
        failing_interval: Some(1),
        ..StubDetector::default()
    });
    let (events, summary) = run_to_end(&harness.pipeline(test_config(&base))).await;

    let calls = harness.detector.calls.lock().unwrap();
    assert_eq!(calls.iter().filter(|interval| interval.index == 1).count(), 3);
    assert_eq!(calls.len(), 7);
    drop(calls);

    assert_eq!(summary.state, PipelineState::Complete);
    assert_eq!(summary.events, 4);
    assert_eq!(summary.segments.len(), 4);
    let generated: Vec<usize> = harness
        .generator
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|request| request.interval.index)
        .collect();
    assert_eq!(generated, vec![0, 2, 3, 4]);
    assert!(warnings(&events)
        .iter()
        .any(|message| message.contains("interval 2/5")));
    assert!(events.iter().any(|event| matches!(
        event,
        ProgressEvent::Status { message, .. } if message == "Analyzed interval 2/5 (0 events)"
    )));
    assert_eq!(chunk_indices(&events), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn client_disconnect_cancels_run() {
    let base = TempDir::new().unwrap();
    let harness = Harness::new(StubMuxer {
        mux_delay: Duration::from_millis(50),
        ..StubMuxer::with_duration(150)
    });
    let config = test_config(&base);
    let call_timeout = Duration::from_secs(config.pipeline.call_timeout_seconds);
    let run = harness.pipeline(config).start(RunRequest::new("/media/match.mp4"));
    let (mut stream, handle) = run.into_parts();

    let mut seen = Vec::new();
    let mut chunks = 0;
    while let Some(event) = stream.next().await {
        if event.kind() == "chunk_ready" {
            chunks += 1;
        }
        seen.push(event);
        if chunks == 2 {
            break;
        }
    }
    drop(stream);

    let summary = tokio::time::timeout(call_timeout, handle.wait())
        .await
        .expect("run should stop within one call timeout")
        .unwrap();
    assert_eq!(summary.state, PipelineState::Cancelled);
    assert!(summary.segments.len() <= 3);
    assert!(harness.muxer.requests.lock().unwrap().len() < 5);
    assert_eq!(harness.muxer.concats.load(Ordering::SeqCst), 0);
    assert!(!seen.iter().any(|event| event.kind() == "error"));
}

#[tokio::test]
async fn explicit_cancel_reaches_cancelled_state() {
    let base = TempDir::new().unwrap();
    let harness = Harness::new(StubMuxer {
        mux_delay: Duration::from_millis(200),
        ..StubMuxer::with_duration(300)
    });
    let run = harness.pipeline(test_config(&base)).start(RunRequest::new("/media/match.mp4"));
    let (mut stream, handle) = run.into_parts();
    let drained = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    });

    let mut state = handle.watch_state();
    state
        .wait_for(|state| matches!(state, PipelineState::Running | PipelineState::Draining))
        .await
        .unwrap();
    handle.cancel();
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.state, PipelineState::Cancelled);
    let events = drained.await.unwrap();
    assert!(!events.iter().any(|event| event.kind() == "complete" || event.kind() == "error"));
}

#[tokio::test]
async fn chunks_are_delivered_in_order_despite_out_of_order_synthesis() {
    let base = TempDir::new().unwrap();
    let mut harness = Harness::new(StubMuxer::with_duration(240));
    harness.synthesizer = Arc::new(StubSynthesizer {
        reverse_latency: true,
        ..StubSynthesizer::default()
    });
    let (events, summary) = run_to_end(&harness.pipeline(test_config(&base))).await;

    assert_eq!(chunk_indices(&events), (0..8).collect::<Vec<u64>>());
    let sequence: Vec<u64> = summary.segments.iter().map(|s| s.sequence_index).collect();
    assert_eq!(sequence, (0..8).collect::<Vec<u64>>());
    let starts: Vec<u64> = summary.segments.iter().map(|s| s.start.as_secs()).collect();
    assert!(starts.windows(2).all(|pair| pair[0] < pair[1]));

    let muxed: Vec<u64> = harness
        .muxer
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(StubMuxer::segment_index)
        .collect();
    assert_eq!(muxed, (0..8).collect::<Vec<u64>>());

    let progress: Vec<u8> = events
        .iter()
        .filter(|event| event.kind() == "chunk_ready")
        .filter_map(ProgressEvent::progress)
        .collect();
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(progress.iter().all(|value| *value <= 95));
}

#[tokio::test]
async fn synthesis_respects_concurrency_cap() {
    let base = TempDir::new().unwrap();
    let mut harness = Harness::new(StubMuxer::with_duration(600));
    harness.synthesizer = Arc::new(StubSynthesizer {
        latency: Duration::from_millis(40),
        ..StubSynthesizer::default()
    });
    let mut config = test_config(&base);
    config.pipeline.concat_final = false;
    let (_, summary) = run_to_end(&harness.pipeline(config)).await;
    assert_eq!(summary.segments.len(), 20);
    let peak = harness.synthesizer.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak in-flight synthesis was {peak}");

    let base = TempDir::new().unwrap();
    let mut harness = Harness::new(StubMuxer::with_duration(300));
    harness.synthesizer = Arc::new(StubSynthesizer {
        latency: Duration::from_millis(20),
        ..StubSynthesizer::default()
    });
    let mut config = test_config(&base);
    config.synthesis.max_in_flight = 2;
    let (_, summary) = run_to_end(&harness.pipeline(config)).await;
    assert_eq!(summary.segments.len(), 10);
    assert!(harness.synthesizer.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn repeated_runs_produce_identical_segments() {
    let mut layouts = Vec::new();
    for _ in 0..2 {
        let base = TempDir::new().unwrap();
        let harness = Harness::new(StubMuxer::with_duration(133));
        let (_, summary) = run_to_end(&harness.pipeline(test_config(&base))).await;
        let encodings: Vec<_> = summary.segments.iter().map(|s| s.encoding.clone()).collect();
        assert!(encodings.windows(2).all(|pair| pair[0] == pair[1]));
        layouts.push(
            summary
                .segments
                .iter()
                .map(|s| (s.sequence_index, s.start, s.end, s.narrated))
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(layouts[0], layouts[1]);
}

#[tokio::test]
async fn utterances_respect_timing_and_word_budget() {
    let base = TempDir::new().unwrap();
    let harness = Harness::new(StubMuxer::with_duration(133));
    let (_, summary) = run_to_end(&harness.pipeline(test_config(&base))).await;
    for segment in &summary.segments {
        let duration = segment.end - segment.start;
        assert!(duration >= Duration::from_secs(5) && duration <= Duration::from_secs(30));
    }
    let requests = harness.generator.requests.lock().unwrap();
    assert_eq!(requests[0].previous_end, None);
    assert_eq!(requests[1].previous_end, Some(Duration::from_secs(28)));
    assert_eq!(requests[4].video_duration, Duration::from_secs(133));
}

#[tokio::test]
async fn narrated_mux_failure_falls_back_then_skips() {
    let base = TempDir::new().unwrap();
    let harness = Harness::new(StubMuxer {
        failing_narrated: HashSet::from([1, 2]),
        failing_plain: HashSet::from([2]),
        ..StubMuxer::with_duration(120)
    });
    let (events, summary) = run_to_end(&harness.pipeline(test_config(&base))).await;

    let delivered: Vec<(u64, u64, bool)> = summary
        .segments
        .iter()
        .map(|s| (s.sequence_index, s.delivery_index, s.narrated))
        .collect();
    assert_eq!(delivered, vec![(0, 0, true), (1, 1, false), (3, 2, true)]);
    assert_eq!(chunk_indices(&events), vec![0, 1, 2]);
    assert_eq!(complete_chunks(&events).map(|(chunks, _)| chunks), Some(3));

    let warnings = warnings(&events);
    assert!(warnings.iter().any(|m| m.contains("Narrated encode failed for utterance 1")));
    assert!(warnings.iter().any(|m| m.contains("Skipped segment for utterance 2")));

    // Narrated encode is attempted twice before the plain fallback.
    let requests = harness.muxer.requests.lock().unwrap();
    let for_one: Vec<bool> = requests
        .iter()
        .filter(|request| StubMuxer::segment_index(request) == 1)
        .map(|request| request.narration.is_some())
        .collect();
    assert_eq!(for_one, vec![true, true, false]);
}

#[tokio::test]
async fn completed_run_writes_manifest_and_final_video() {
    let base = TempDir::new().unwrap();
    let harness = Harness::new(StubMuxer::with_duration(90));
    let config = test_config(&base);
    let pipeline = harness.pipeline(config.clone());
    let (events, summary) = {
        let (events, summary) = pipeline
            .start(RunRequest {
                video: PathBuf::from("/media/match.mp4"),
                session_id: Some("session-a".into()),
                concat_final: None,
            })
            .collect()
            .await;
        (events, summary.unwrap())
    };

    let (chunks, final_url) = complete_chunks(&events).unwrap();
    assert_eq!(chunks, 3);
    assert_eq!(final_url, "/videos/generated/commentary_session-a.mp4");
    let final_path = summary.final_video.clone().unwrap();
    assert!(final_path.ends_with("videos/generated/commentary_session-a.mp4"));
    assert!(final_path.exists());

    match &events.iter().find(|event| event.kind() == "chunk_ready") {
        Some(ProgressEvent::ChunkReady {
            url,
            start_time,
            end_time,
            ..
        }) => {
            assert_eq!(url, "/videos/streaming/session-a/segment_0000.mp4");
            assert_eq!(start_time, "00:00:02");
            assert_eq!(end_time, "00:00:28");
        }
        other => panic!("unexpected {other:?}"),
    }

    let manifest_path = summary.manifest.clone().unwrap();
    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["session_id"], "session-a");
    assert_eq!(manifest["state"], "COMPLETE");
    assert_eq!(manifest["intervals"].as_array().unwrap().len(), 3);
    assert_eq!(manifest["utterances"].as_array().unwrap().len(), 3);
    let segments = manifest["segments"].as_array().unwrap();
    assert_eq!(segments.len(), 3);
    assert!(segments
        .iter()
        .all(|segment| segment["sha256"].as_str().unwrap().len() == 64));
    assert_eq!(manifest["final_video"]["url"], final_url);

    assert!(config
        .sessions_dir()
        .join("session-a/narration/narration_0000.mp3")
        .exists());
}

#[tokio::test]
async fn disabled_synthesis_passes_original_audio_through() {
    let base = TempDir::new().unwrap();
    let harness = Harness::new(StubMuxer::with_duration(60));
    let mut config = test_config(&base);
    config.synthesis.enabled = false;
    let (events, summary) = run_to_end(&harness.pipeline(config)).await;

    assert_eq!(summary.segments.len(), 2);
    assert!(summary.segments.iter().all(|segment| !segment.narrated));
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 0);
    let disabled: Vec<String> = warnings(&events)
        .into_iter()
        .filter(|message| message.contains("synthesis disabled"))
        .collect();
    assert_eq!(disabled.len(), 1);
}

#[tokio::test]
async fn unreadable_source_fails_before_any_stage() {
    let base = TempDir::new().unwrap();
    let harness = Harness::new(StubMuxer {
        fatal: true,
        ..StubMuxer::default()
    });
    let run = harness.pipeline(test_config(&base)).start(RunRequest::new("/media/broken.mp4"));
    let state = run.handle().watch_state();
    let (events, result) = run.collect().await;

    assert!(matches!(result, Err(PipelineError::Source(CollaboratorError::FatalInput { .. }))));
    assert_eq!(*state.borrow(), PipelineState::Failed);
    assert_eq!(events.last().map(ProgressEvent::kind), Some("error"));
    assert!(harness.detector.calls.lock().unwrap().is_empty());
}
