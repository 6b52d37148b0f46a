use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Half-open analysis window `[start, end)` over the source video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Interval {
    pub index: usize,
    #[serde(with = "seconds")]
    pub start: Duration,
    #[serde(with = "seconds")]
    pub end: Duration,
}

impl Interval {
    pub fn length(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, at: Duration) -> bool {
        at >= self.start && at < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(with = "seconds")]
    pub timestamp: Duration,
    pub description: String,
    pub players: Vec<String>,
    pub is_replay: bool,
    pub intensity: u8,
    pub interval: usize,
}

/// Events detected for one interval. An empty batch is a valid outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub interval: Interval,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speaker {
    #[serde(rename = "COMMENTATOR_1")]
    Commentator1,
    #[serde(rename = "COMMENTATOR_2")]
    Commentator2,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Commentator1 => "COMMENTATOR_1",
            Speaker::Commentator2 => "COMMENTATOR_2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "COMMENTATOR_1" => Some(Speaker::Commentator1),
            "COMMENTATOR_2" => Some(Speaker::Commentator2),
            _ => None,
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw commentary line as returned by the generation collaborator, before
/// timing normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtteranceDraft {
    pub start_time: String,
    pub end_time: String,
    pub text: String,
    pub speaker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub sequence_index: u64,
    #[serde(with = "seconds")]
    pub start: Duration,
    #[serde(with = "seconds")]
    pub end: Duration,
    pub text: String,
    pub speaker: Speaker,
    pub interval: usize,
    pub source_events: Vec<Event>,
}

impl Utterance {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
    Ogg,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Ogg => "ogg",
        }
    }

    /// Maps a response content type onto a known format, defaulting to mp3.
    pub fn from_content_type(value: &str) -> Self {
        let lowered = value.to_ascii_lowercase();
        if lowered.contains("wav") {
            AudioFormat::Wav
        } else if lowered.contains("ogg") || lowered.contains("opus") {
            AudioFormat::Ogg
        } else {
            AudioFormat::Mp3
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NarrationTrack {
    Synthesized { bytes: Vec<u8>, format: AudioFormat },
    Absent { reason: String },
}

impl NarrationTrack {
    pub fn absent(reason: impl Into<String>) -> Self {
        NarrationTrack::Absent {
            reason: reason.into(),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, NarrationTrack::Synthesized { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NarrationAudio {
    pub sequence_index: u64,
    pub track: NarrationTrack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodingProfile {
    pub container: String,
    pub video_codec: String,
    pub preset: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub audio_bitrate: String,
    pub audio_channels: u8,
}

impl EncodingProfile {
    /// ffmpeg muxer for the configured container.
    pub fn muxer(&self) -> Option<&'static str> {
        container_muxer(&self.container)
    }
}

/// Maps a container file extension to the ffmpeg muxer that writes it.
pub fn container_muxer(container: &str) -> Option<&'static str> {
    match container.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => Some("mp4"),
        "mov" => Some("mov"),
        "mkv" => Some("matroska"),
        "webm" => Some("webm"),
        "ts" => Some("mpegts"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub sequence_index: u64,
    pub delivery_index: u64,
    pub path: PathBuf,
    pub url: String,
    #[serde(with = "seconds")]
    pub start: Duration,
    #[serde(with = "seconds")]
    pub end: Duration,
    pub encoding: EncodingProfile,
    pub narrated: bool,
}

/// Channel payload between stages; end-of-stream is distinct from an empty
/// item.
#[derive(Debug, Clone, PartialEq)]
pub enum StageMessage<T> {
    Item(T),
    EndOfStream,
}

pub(crate) mod seconds {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
