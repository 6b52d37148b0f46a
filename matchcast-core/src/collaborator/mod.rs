mod error;
pub mod ffmpeg;
pub mod http;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::CommentarySection;
use crate::model::{AudioFormat, EncodingProfile, Event, Interval, Speaker, UtteranceDraft};

pub use error::{CollaboratorError, CollaboratorResult};
pub use ffmpeg::{CommandExecutor, FfmpegMuxer, SystemCommandExecutor};
pub use http::{HttpDetector, HttpGenerator, HttpSynthesizer};

/// Source video after probing, possibly rewritten with a silent audio track.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSource {
    pub path: PathBuf,
    pub duration: Duration,
    pub added_silent_track: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingConstraints {
    pub min_duration_seconds: f64,
    pub max_duration_seconds: f64,
    pub words_per_second: f64,
    pub min_gap_seconds: f64,
    pub max_gap_seconds: f64,
}

impl From<&CommentarySection> for TimingConstraints {
    fn from(section: &CommentarySection) -> Self {
        Self {
            min_duration_seconds: section.min_duration_seconds,
            max_duration_seconds: section.max_duration_seconds,
            words_per_second: section.words_per_second,
            min_gap_seconds: section.min_gap_seconds,
            max_gap_seconds: section.max_gap_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub interval: Interval,
    pub events: Vec<Event>,
    pub constraints: TimingConstraints,
    pub previous_end: Option<Duration>,
    pub video_duration: Duration,
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixSettings {
    pub original_volume: f64,
    pub narration_delay: Duration,
}

/// One segment encode: `[start, end)` of the source, optionally mixed with a
/// narration file.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxRequest {
    pub source: PathBuf,
    pub start: Duration,
    pub end: Duration,
    pub narration: Option<PathBuf>,
    pub output: PathBuf,
    pub encoding: EncodingProfile,
    pub mix: MixSettings,
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(
        &self,
        source: &PreparedSource,
        interval: &Interval,
    ) -> CollaboratorResult<Vec<Event>>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> CollaboratorResult<Vec<UtteranceDraft>>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, speaker: Speaker) -> CollaboratorResult<SynthesizedAudio>;
}

#[async_trait]
pub trait Muxer: Send + Sync {
    async fn prepare_source(
        &self,
        video: &Path,
        scratch_dir: &Path,
    ) -> CollaboratorResult<PreparedSource>;

    async fn mux(&self, request: &MuxRequest) -> CollaboratorResult<()>;

    async fn concat(
        &self,
        segments: &[PathBuf],
        list_path: &Path,
        output: &Path,
    ) -> CollaboratorResult<()>;
}
