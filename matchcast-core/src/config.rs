use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{ConfigError, Result};
use crate::model::{container_muxer, EncodingProfile, Speaker};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PipelineConfig {
    pub paths: PathsSection,
    pub intervals: IntervalsSection,
    pub commentary: CommentarySection,
    pub synthesis: SynthesisSection,
    pub muxing: MuxingSection,
    pub retry: RetrySection,
    pub pipeline: PipelineSection,
    pub collaborators: CollaboratorsSection,
    pub cleanup: CleanupSection,
}

impl PipelineConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.videos_dir)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.sessions_dir)
    }

    pub fn final_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.final_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.intervals.window_seconds <= 0.0 || !self.intervals.window_seconds.is_finite() {
            return Err(ConfigError::Invalid {
                field: "intervals.window_seconds",
                reason: format!("must be positive, got {}", self.intervals.window_seconds),
            });
        }
        let commentary = &self.commentary;
        if commentary.min_duration_seconds <= 0.0
            || commentary.min_duration_seconds > commentary.max_duration_seconds
        {
            return Err(ConfigError::Invalid {
                field: "commentary.min_duration_seconds",
                reason: format!(
                    "expected 0 < min ({}) <= max ({})",
                    commentary.min_duration_seconds, commentary.max_duration_seconds
                ),
            });
        }
        if commentary.min_gap_seconds < 0.0 || commentary.min_gap_seconds > commentary.max_gap_seconds
        {
            return Err(ConfigError::Invalid {
                field: "commentary.min_gap_seconds",
                reason: format!(
                    "expected 0 <= min ({}) <= max ({})",
                    commentary.min_gap_seconds, commentary.max_gap_seconds
                ),
            });
        }
        if commentary.words_per_second <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "commentary.words_per_second",
                reason: "must be positive".to_string(),
            });
        }
        if self.synthesis.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                field: "synthesis.max_in_flight",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.channel_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retry.max_attempts == 0 || self.retry.mux_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "attempt counts must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.muxing.original_volume) {
            return Err(ConfigError::Invalid {
                field: "muxing.original_volume",
                reason: format!("expected 0.0..=1.0, got {}", self.muxing.original_volume),
            });
        }
        if self.muxing.narration_delay_seconds < 0.0 {
            return Err(ConfigError::Invalid {
                field: "muxing.narration_delay_seconds",
                reason: "must not be negative".to_string(),
            });
        }
        if container_muxer(&self.muxing.container).is_none() {
            return Err(ConfigError::Invalid {
                field: "muxing.container",
                reason: format!(
                    "unsupported container {}, expected one of mp4, m4v, mov, mkv, webm, ts",
                    self.muxing.container
                ),
            });
        }
        let collaborators = &self.collaborators;
        for (field, endpoint) in [
            ("collaborators.detection_endpoint", &collaborators.detection_endpoint),
            ("collaborators.generation_endpoint", &collaborators.generation_endpoint),
            ("collaborators.synthesis_endpoint", &collaborators.synthesis_endpoint),
        ] {
            match Url::parse(endpoint) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => {
                    return Err(ConfigError::Invalid {
                        field,
                        reason: format!("unsupported scheme {}", url.scheme()),
                    })
                }
                Err(err) => {
                    return Err(ConfigError::Invalid {
                        field,
                        reason: format!("{endpoint}: {err}"),
                    })
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub videos_dir: String,
    pub sessions_dir: String,
    pub final_dir: String,
    pub public_base_url: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".into(),
            videos_dir: "videos".into(),
            sessions_dir: "videos/streaming".into(),
            final_dir: "videos/generated".into(),
            public_base_url: "/videos".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalsSection {
    pub window_seconds: f64,
}

impl Default for IntervalsSection {
    fn default() -> Self {
        Self {
            window_seconds: 30.0,
        }
    }
}

impl IntervalsSection {
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_seconds.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommentarySection {
    pub min_duration_seconds: f64,
    pub max_duration_seconds: f64,
    pub words_per_second: f64,
    pub min_gap_seconds: f64,
    pub max_gap_seconds: f64,
}

impl Default for CommentarySection {
    fn default() -> Self {
        Self {
            min_duration_seconds: 5.0,
            max_duration_seconds: 30.0,
            words_per_second: 2.5,
            min_gap_seconds: 1.0,
            max_gap_seconds: 4.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisSection {
    pub enabled: bool,
    pub max_in_flight: usize,
    pub model_id: String,
    pub voices: HashMap<String, String>,
}

impl SynthesisSection {
    pub fn voice_for(&self, speaker: Speaker) -> Option<&str> {
        self.voices.get(speaker.as_str()).map(String::as_str)
    }
}

impl Default for SynthesisSection {
    fn default() -> Self {
        let mut voices = HashMap::new();
        voices.insert(
            Speaker::Commentator1.as_str().to_string(),
            "nrD2uNU2IUYtedZegcGx".to_string(),
        );
        voices.insert(
            Speaker::Commentator2.as_str().to_string(),
            "pNInz6obpgDQGcFmaJgB".to_string(),
        );
        Self {
            enabled: true,
            max_in_flight: 5,
            model_id: "eleven_multilingual_v2".into(),
            voices,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxingSection {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub log_level: String,
    pub original_volume: f64,
    pub narration_delay_seconds: f64,
    pub timeout_seconds: u64,
    pub container: String,
    pub video_codec: String,
    pub preset: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub audio_bitrate: String,
    pub audio_channels: u8,
}

impl Default for MuxingSection {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            log_level: "error".into(),
            original_volume: 0.2,
            narration_delay_seconds: 1.0,
            timeout_seconds: 300,
            container: "mp4".into(),
            video_codec: "libx264".into(),
            preset: "ultrafast".into(),
            audio_codec: "aac".into(),
            sample_rate: 44_100,
            audio_bitrate: "192k".into(),
            audio_channels: 2,
        }
    }
}

impl MuxingSection {
    pub fn encoding_profile(&self) -> EncodingProfile {
        EncodingProfile {
            container: self.container.clone(),
            video_codec: self.video_codec.clone(),
            preset: self.preset.clone(),
            audio_codec: self.audio_codec.clone(),
            sample_rate: self.sample_rate,
            audio_bitrate: self.audio_bitrate.clone(),
            audio_channels: self.audio_channels,
        }
    }

    pub fn narration_delay(&self) -> Duration {
        Duration::from_secs_f64(self.narration_delay_seconds.max(0.0))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub mux_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 0,
            mux_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub channel_capacity: usize,
    pub call_timeout_seconds: u64,
    pub cancel_grace_seconds: u64,
    pub concat_final: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            channel_capacity: 3,
            call_timeout_seconds: 120,
            cancel_grace_seconds: 5,
            concat_final: true,
        }
    }
}

impl PipelineSection {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollaboratorsSection {
    pub detection_endpoint: String,
    pub generation_endpoint: String,
    pub synthesis_endpoint: String,
    pub api_key_env: Option<String>,
    pub synthesis_api_key_env: Option<String>,
    pub request_timeout_seconds: u64,
    pub match_context: Option<String>,
}

impl Default for CollaboratorsSection {
    fn default() -> Self {
        Self {
            detection_endpoint: "http://127.0.0.1:8700/detect".into(),
            generation_endpoint: "http://127.0.0.1:8700/generate".into(),
            synthesis_endpoint: "http://127.0.0.1:8701/synthesize".into(),
            api_key_env: None,
            synthesis_api_key_env: None,
            request_timeout_seconds: 90,
            match_context: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupSection {
    pub retention_hours: u64,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            retention_hours: 24,
        }
    }
}

impl CleanupSection {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let config: PipelineConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
