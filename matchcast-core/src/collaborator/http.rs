use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{AudioFormat, Event, Interval, Speaker, UtteranceDraft};
use crate::timecode::{format_hms, parse_timecode};

use super::{
    CollaboratorError, CollaboratorResult, Detector, GenerationRequest, Generator, PreparedSource,
    SynthesizedAudio, Synthesizer, TimingConstraints,
};

/// Maps an HTTP status onto the collaborator error taxonomy.
pub fn classify_status(status: StatusCode, detail: impl Into<String>) -> CollaboratorError {
    let message = format!("status {}: {}", status.as_u16(), detail.into());
    match status.as_u16() {
        401 | 402 | 403 => CollaboratorError::QuotaExceeded(message),
        408 | 429 => CollaboratorError::Transient(message),
        code if code >= 500 => CollaboratorError::Transient(message),
        _ => CollaboratorError::Validation(message),
    }
}

#[derive(Debug, Clone)]
struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpEndpoint {
    fn new(url: impl Into<String>, timeout: Duration) -> CollaboratorResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: None,
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, body: &B) -> CollaboratorResult<reqwest::Response> {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(classify_status(status, truncate_detail(&detail)))
    }
}

fn truncate_detail(detail: &str) -> String {
    const LIMIT: usize = 240;
    let trimmed = detail.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct DetectionBody<'a> {
    video_path: String,
    interval_index: usize,
    start_time: String,
    end_time: String,
    start_seconds: f64,
    end_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    events: Vec<WireEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEvent {
    time: String,
    description: String,
    #[serde(default)]
    players: Vec<String>,
    #[serde(default)]
    replay: bool,
    intensity: i64,
}

impl WireEvent {
    fn from_event(event: &Event) -> Self {
        Self {
            time: format_hms(event.timestamp),
            description: event.description.clone(),
            players: event.players.clone(),
            replay: event.is_replay,
            intensity: i64::from(event.intensity),
        }
    }

    fn into_event(self, interval: &Interval) -> Result<Event, String> {
        let timestamp = parse_timecode(&self.time).map_err(|err| err.to_string())?;
        let description = self.description.trim();
        if description.is_empty() {
            return Err(format!("event at {} has an empty description", self.time));
        }
        if !(1..=10).contains(&self.intensity) {
            return Err(format!(
                "event at {} has intensity {} outside 1..=10",
                self.time, self.intensity
            ));
        }
        Ok(Event {
            timestamp,
            description: description.to_string(),
            players: self.players,
            is_replay: self.replay,
            intensity: self.intensity as u8,
            interval: interval.index,
        })
    }
}

/// Converts wire events, dropping records that fail validation.
fn events_from_wire(interval: &Interval, wire: Vec<WireEvent>) -> Vec<Event> {
    let mut events = Vec::with_capacity(wire.len());
    for record in wire {
        match record.into_event(interval) {
            Ok(event) => events.push(event),
            Err(reason) => warn!(interval = interval.index, %reason, "discarding detected event"),
        }
    }
    events.sort_by_key(|event| event.timestamp);
    events
}

pub struct HttpDetector {
    endpoint: HttpEndpoint,
    context: Option<String>,
}

impl HttpDetector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> CollaboratorResult<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(url, timeout)?,
            context: None,
        })
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.endpoint.api_key = key;
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(
        &self,
        source: &PreparedSource,
        interval: &Interval,
    ) -> CollaboratorResult<Vec<Event>> {
        let body = DetectionBody {
            video_path: source.path.to_string_lossy().into_owned(),
            interval_index: interval.index,
            start_time: format_hms(interval.start),
            end_time: format_hms(interval.end),
            start_seconds: interval.start.as_secs_f64(),
            end_seconds: interval.end.as_secs_f64(),
            context: self.context.as_deref(),
        };
        let response = self.endpoint.post(&body).await?;
        let payload: DetectionResponse = response.json().await?;
        debug!(
            interval = interval.index,
            received = payload.events.len(),
            "detection response"
        );
        Ok(events_from_wire(interval, payload.events))
    }
}

#[derive(Debug, Serialize)]
struct GenerationBody<'a> {
    interval_index: usize,
    start_time: String,
    end_time: String,
    video_duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_end_time: Option<String>,
    events: Vec<WireEvent>,
    constraints: TimingConstraints,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(alias = "utterances")]
    commentaries: Vec<WireCommentary>,
}

#[derive(Debug, Deserialize)]
struct WireCommentary {
    start_time: String,
    end_time: String,
    #[serde(alias = "text")]
    commentary: String,
    speaker: String,
}

impl From<WireCommentary> for UtteranceDraft {
    fn from(wire: WireCommentary) -> Self {
        UtteranceDraft {
            start_time: wire.start_time,
            end_time: wire.end_time,
            text: wire.commentary,
            speaker: wire.speaker,
        }
    }
}

pub struct HttpGenerator {
    endpoint: HttpEndpoint,
}

impl HttpGenerator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> CollaboratorResult<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(url, timeout)?,
        })
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.endpoint.api_key = key;
        self
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> CollaboratorResult<Vec<UtteranceDraft>> {
        let body = GenerationBody {
            interval_index: request.interval.index,
            start_time: format_hms(request.interval.start),
            end_time: format_hms(request.interval.end),
            video_duration_seconds: request.video_duration.as_secs_f64(),
            previous_end_time: request.previous_end.map(format_hms),
            events: request.events.iter().map(WireEvent::from_event).collect(),
            constraints: request.constraints,
            context: request.context.as_deref(),
        };
        let response = self.endpoint.post(&body).await?;
        let payload: GenerationResponse = response.json().await?;
        Ok(payload.commentaries.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Serialize)]
struct SynthesisBody<'a> {
    text: &'a str,
    voice_id: &'a str,
    model_id: &'a str,
    speaker: Speaker,
}

#[derive(Debug, Deserialize)]
struct EncodedAudio {
    audio_base64: String,
    #[serde(default)]
    format: Option<String>,
}

/// Accepts either a raw audio body or a JSON envelope carrying base64 audio.
fn decode_audio_body(content_type: &str, body: &[u8]) -> CollaboratorResult<SynthesizedAudio> {
    if content_type.to_ascii_lowercase().contains("json") {
        let envelope: EncodedAudio = serde_json::from_slice(body)?;
        let bytes = BASE64
            .decode(envelope.audio_base64.trim())
            .map_err(|err| CollaboratorError::Validation(format!("invalid base64 audio: {err}")))?;
        if bytes.is_empty() {
            return Err(CollaboratorError::Validation(
                "synthesis returned empty audio".to_string(),
            ));
        }
        let format = envelope
            .format
            .as_deref()
            .map(AudioFormat::from_content_type)
            .unwrap_or(AudioFormat::Mp3);
        return Ok(SynthesizedAudio { bytes, format });
    }
    if body.is_empty() {
        return Err(CollaboratorError::Validation(
            "synthesis returned empty audio".to_string(),
        ));
    }
    Ok(SynthesizedAudio {
        bytes: body.to_vec(),
        format: AudioFormat::from_content_type(content_type),
    })
}

pub struct HttpSynthesizer {
    endpoint: HttpEndpoint,
    voices: HashMap<String, String>,
    model_id: String,
}

impl HttpSynthesizer {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        voices: HashMap<String, String>,
        model_id: impl Into<String>,
    ) -> CollaboratorResult<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(url, timeout)?,
            voices,
            model_id: model_id.into(),
        })
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.endpoint.api_key = key;
        self
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, speaker: Speaker) -> CollaboratorResult<SynthesizedAudio> {
        let voice_id = self.voices.get(speaker.as_str()).ok_or_else(|| {
            CollaboratorError::Validation(format!("no voice configured for {speaker}"))
        })?;
        let body = SynthesisBody {
            text,
            voice_id,
            model_id: &self.model_id,
            speaker,
        };
        let response = self.endpoint.post(&body).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let bytes = response.bytes().await?;
        decode_audio_body(&content_type, &bytes)
    }
}
