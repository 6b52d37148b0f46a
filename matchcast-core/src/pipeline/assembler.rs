use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborator::{MixSettings, MuxRequest, Muxer, PreparedSource};
use crate::model::{EncodingProfile, NarrationTrack, Segment, StageMessage, Utterance};
use crate::retry::{RetryError, RetryPolicy};

use super::audio::NarratedUtterance;
use super::session::{public_url, PipelineSession, Reporter};

/// Where segment URLs are rooted.
#[derive(Debug, Clone)]
pub struct PublicLocation {
    pub base_url: String,
    pub videos_dir: PathBuf,
}

impl PublicLocation {
    pub fn url_for(&self, path: &Path) -> String {
        public_url(&self.base_url, &self.videos_dir, path)
    }
}

/// Restores sequence order and turns each narrated utterance into a
/// playable segment.
pub struct ChunkAssembler {
    muxer: Arc<dyn Muxer>,
    source: PreparedSource,
    session: Arc<PipelineSession>,
    encoding: EncodingProfile,
    mix: MixSettings,
    retry: RetryPolicy,
    reporter: Reporter,
    location: PublicLocation,
}

enum Assembly {
    Delivered(Segment),
    Skipped,
    Cancelled,
}

impl ChunkAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        muxer: Arc<dyn Muxer>,
        source: PreparedSource,
        session: Arc<PipelineSession>,
        encoding: EncodingProfile,
        mix: MixSettings,
        retry: RetryPolicy,
        reporter: Reporter,
        location: PublicLocation,
    ) -> Self {
        Self {
            muxer,
            source,
            session,
            encoding,
            mix,
            retry,
            reporter,
            location,
        }
    }

    pub async fn run(
        self,
        mut input: mpsc::Receiver<StageMessage<NarratedUtterance>>,
        cancel: CancellationToken,
    ) -> Vec<Segment> {
        let mut pending: BTreeMap<u64, NarratedUtterance> = BTreeMap::new();
        let mut next_index = 0u64;
        let mut segments = Vec::new();

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return segments,
                message = input.recv() => message,
            };
            match message {
                Some(StageMessage::Item((utterance, audio))) => {
                    if utterance.sequence_index < next_index {
                        warn!(index = utterance.sequence_index, "duplicate utterance ignored");
                        continue;
                    }
                    pending.insert(utterance.sequence_index, (utterance, audio));
                }
                Some(StageMessage::EndOfStream) | None => break,
            }
            while let Some((utterance, audio)) = pending.remove(&next_index) {
                next_index += 1;
                match self.assemble(utterance, audio.track, &cancel).await {
                    Assembly::Delivered(segment) => segments.push(segment),
                    Assembly::Skipped => {}
                    Assembly::Cancelled => return segments,
                }
            }
        }

        if !pending.is_empty() {
            warn!(
                missing_from = next_index,
                buffered = pending.len(),
                "sequence gap at end of stream, assembling remaining utterances"
            );
        }
        for (_, (utterance, audio)) in std::mem::take(&mut pending) {
            match self.assemble(utterance, audio.track, &cancel).await {
                Assembly::Delivered(segment) => segments.push(segment),
                Assembly::Skipped => {}
                Assembly::Cancelled => return segments,
            }
        }

        info!(segments = segments.len(), "chunk assembler finished");
        segments
    }

    async fn assemble(
        &self,
        utterance: Utterance,
        track: NarrationTrack,
        cancel: &CancellationToken,
    ) -> Assembly {
        if cancel.is_cancelled() {
            return Assembly::Cancelled;
        }
        let index = utterance.sequence_index;
        let output = self
            .session
            .segment_path(index, &self.encoding.container);

        let narration = match &track {
            NarrationTrack::Synthesized { bytes, format } => {
                match self.write_narration(index, bytes, format.extension()).await {
                    Ok(path) => Some(path),
                    Err(err) => {
                        self.reporter
                            .warning(format!(
                                "Could not store narration for utterance {index}: {err}"
                            ))
                            .await;
                        None
                    }
                }
            }
            NarrationTrack::Absent { reason } => {
                debug!(index, %reason, "assembling without narration");
                None
            }
        };

        let narrated = narration.is_some();
        let request = MuxRequest {
            source: self.source.path.clone(),
            start: utterance.start,
            end: utterance.end,
            narration,
            output: output.clone(),
            encoding: self.encoding.clone(),
            mix: self.mix,
        };

        let mut delivered_narrated = narrated;
        match self.encode(&request, index, cancel).await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => return Assembly::Cancelled,
            Err(err) if narrated => {
                self.reporter
                    .warning(format!(
                        "Narrated encode failed for utterance {index}, using original audio: {err}"
                    ))
                    .await;
                let fallback = MuxRequest {
                    narration: None,
                    ..request
                };
                match self.encode(&fallback, index, cancel).await {
                    Ok(()) => delivered_narrated = false,
                    Err(err) if err.is_cancelled() => return Assembly::Cancelled,
                    Err(err) => {
                        self.reporter
                            .warning(format!("Skipped segment for utterance {index}: {err}"))
                            .await;
                        return Assembly::Skipped;
                    }
                }
            }
            Err(err) => {
                self.reporter
                    .warning(format!("Skipped segment for utterance {index}: {err}"))
                    .await;
                return Assembly::Skipped;
            }
        }

        if cancel.is_cancelled() {
            return Assembly::Cancelled;
        }
        let segment = Segment {
            sequence_index: index,
            delivery_index: self.session.next_delivery_index(),
            url: self.location.url_for(&output),
            path: output,
            start: utterance.start,
            end: utterance.end,
            encoding: self.encoding.clone(),
            narrated: delivered_narrated,
        };
        info!(
            index,
            delivery = segment.delivery_index,
            narrated = segment.narrated,
            "segment ready"
        );
        self.reporter
            .chunk_ready(&segment, self.session.progress())
            .await;
        Assembly::Delivered(segment)
    }

    async fn encode(
        &self,
        request: &MuxRequest,
        index: u64,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError> {
        let label = format!("mux segment {index}");
        self.retry
            .run(&label, cancel, |_| self.muxer.mux(request))
            .await
            .map(|outcome| outcome.result)
    }

    async fn write_narration(
        &self,
        index: u64,
        bytes: &[u8],
        extension: &str,
    ) -> std::io::Result<PathBuf> {
        let dir = self.session.narration_dir();
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("narration_{index:04}.{extension}"));
        fs::write(&path, bytes).await?;
        Ok(path)
    }
}
