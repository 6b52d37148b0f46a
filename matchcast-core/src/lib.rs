pub mod cleanup;
pub mod collaborator;
pub mod config;
pub mod context;
pub mod error;
pub mod interval;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod timecode;

pub use cleanup::{JanitorError, JanitorResult, SessionJanitor, SweepReport};
pub use collaborator::{
    CollaboratorError, CollaboratorResult, CommandExecutor, Detector, FfmpegMuxer,
    GenerationRequest, Generator, HttpDetector, HttpGenerator, HttpSynthesizer, MixSettings,
    MuxRequest, Muxer, PreparedSource, SynthesizedAudio, Synthesizer, SystemCommandExecutor,
    TimingConstraints,
};
pub use config::{load_pipeline_config, PipelineConfig};
pub use context::{ContextError, MatchContext};
pub use error::{ConfigError, Result};
pub use interval::{IntervalError, IntervalResult, IntervalSplitter};
pub use model::{
    AudioFormat, EncodingProfile, Event, EventBatch, Interval, NarrationAudio, NarrationTrack,
    Segment, Speaker, StageMessage, Utterance, UtteranceDraft,
};
pub use pipeline::{
    Pipeline, PipelineError, PipelineResult, PipelineRun, PipelineState, ProgressEvent,
    RunHandle, RunRequest, RunSummary,
};
pub use retry::{RetryError, RetryOutcome, RetryPolicy, RetryResult};
pub use timecode::{format_hms, parse_timecode, TimecodeError};
