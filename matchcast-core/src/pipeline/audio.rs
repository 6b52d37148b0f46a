use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborator::Synthesizer;
use crate::model::{NarrationAudio, NarrationTrack, StageMessage, Utterance};
use crate::retry::RetryPolicy;

use super::send_or_cancel;
use super::session::Reporter;

pub type NarratedUtterance = (Utterance, NarrationAudio);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AudioReport {
    pub synthesized: usize,
    pub absent: usize,
}

/// Synthesises narration with at most `max_in_flight` concurrent calls.
/// Results are forwarded in completion order.
pub struct AudioStage {
    synthesizer: Option<Arc<dyn Synthesizer>>,
    retry: RetryPolicy,
    reporter: Reporter,
    max_in_flight: usize,
}

impl AudioStage {
    pub fn new(
        synthesizer: Option<Arc<dyn Synthesizer>>,
        retry: RetryPolicy,
        reporter: Reporter,
        max_in_flight: usize,
    ) -> Self {
        Self {
            synthesizer,
            retry,
            reporter,
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub async fn run(
        self,
        input: mpsc::Receiver<StageMessage<Utterance>>,
        output: mpsc::Sender<StageMessage<NarratedUtterance>>,
        cancel: CancellationToken,
    ) -> AudioReport {
        match self.synthesizer.clone() {
            Some(synthesizer) => self.run_synthesis(synthesizer, input, output, cancel).await,
            None => self.run_passthrough(input, output, cancel).await,
        }
    }

    async fn run_passthrough(
        self,
        mut input: mpsc::Receiver<StageMessage<Utterance>>,
        output: mpsc::Sender<StageMessage<NarratedUtterance>>,
        cancel: CancellationToken,
    ) -> AudioReport {
        let mut report = AudioReport::default();
        let mut announced = false;
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return report,
                message = input.recv() => message,
            };
            let utterance = match message {
                Some(StageMessage::Item(utterance)) => utterance,
                Some(StageMessage::EndOfStream) | None => break,
            };
            if !announced {
                self.reporter
                    .warning("Speech synthesis disabled; segments carry original audio only")
                    .await;
                announced = true;
            }
            report.absent += 1;
            let audio = NarrationAudio {
                sequence_index: utterance.sequence_index,
                track: NarrationTrack::absent("synthesis disabled"),
            };
            if !send_or_cancel(&output, StageMessage::Item((utterance, audio)), &cancel).await {
                return report;
            }
        }
        send_or_cancel(&output, StageMessage::EndOfStream, &cancel).await;
        report
    }

    async fn run_synthesis(
        self,
        synthesizer: Arc<dyn Synthesizer>,
        mut input: mpsc::Receiver<StageMessage<Utterance>>,
        output: mpsc::Sender<StageMessage<NarratedUtterance>>,
        cancel: CancellationToken,
    ) -> AudioReport {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks: JoinSet<bool> = JoinSet::new();
        let mut report = AudioReport::default();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = input.recv() => message,
            };
            let utterance = match message {
                Some(StageMessage::Item(utterance)) => utterance,
                Some(StageMessage::EndOfStream) | None => break,
            };

            let synthesizer = Arc::clone(&synthesizer);
            let retry = self.retry.clone();
            let reporter = self.reporter.clone();
            let output = output.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let index = utterance.sequence_index;
                // Runs apart so a panicking synthesizer still yields an outcome
                // for this index.
                let call = {
                    let cancel = cancel.clone();
                    let text = utterance.text.clone();
                    let speaker = utterance.speaker;
                    tokio::spawn(async move {
                        let label = format!("synthesize utterance {index}");
                        retry
                            .run(&label, &cancel, |_| synthesizer.synthesize(&text, speaker))
                            .await
                    })
                };
                let (reason, detail) = match call.await {
                    Ok(Ok(outcome)) => {
                        debug!(index, attempts = outcome.attempts, "narration synthesized");
                        let track = NarrationTrack::Synthesized {
                            bytes: outcome.result.bytes,
                            format: outcome.result.format,
                        };
                        return forward(&output, utterance, track, &cancel).await;
                    }
                    Ok(Err(err)) if err.is_cancelled() => return false,
                    Ok(Err(err)) if err.is_quota() => ("quota exceeded", err.to_string()),
                    Ok(Err(err)) => ("synthesis failed", err.to_string()),
                    Err(err) => {
                        warn!(index, error = %err, "synthesis task failed");
                        ("synthesis task failed", err.to_string())
                    }
                };
                reporter
                    .warning(format!(
                        "Narration unavailable for utterance {index} ({reason}): {detail}"
                    ))
                    .await;
                forward(&output, utterance, NarrationTrack::absent(reason), &cancel).await;
                false
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => report.synthesized += 1,
                Ok(false) => report.absent += 1,
                Err(err) => warn!(error = %err, "synthesis task failed"),
            }
        }

        if !cancel.is_cancelled() {
            send_or_cancel(&output, StageMessage::EndOfStream, &cancel).await;
        }
        info!(
            synthesized = report.synthesized,
            absent = report.absent,
            "audio stage finished"
        );
        report
    }
}

/// Sends one narrated utterance downstream. True when a synthesized track
/// was delivered.
async fn forward(
    output: &mpsc::Sender<StageMessage<NarratedUtterance>>,
    utterance: Utterance,
    track: NarrationTrack,
    cancel: &CancellationToken,
) -> bool {
    let synthesized = track.is_present();
    let audio = NarrationAudio {
        sequence_index: utterance.sequence_index,
        track,
    };
    send_or_cancel(output, StageMessage::Item((utterance, audio)), cancel).await && synthesized
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::collaborator::{CollaboratorError, CollaboratorResult, SynthesizedAudio};
    use crate::config::RetrySection;
    use crate::model::{AudioFormat, Speaker};
    use crate::pipeline::ProgressEvent;

    struct FlakySynthesizer;

    #[async_trait]
    impl Synthesizer for FlakySynthesizer {
        async fn synthesize(&self, text: &str, _speaker: Speaker) -> CollaboratorResult<SynthesizedAudio> {
            match text {
                "boom" => panic!("voice model crashed"),
                "quota" => Err(CollaboratorError::QuotaExceeded("out of characters".into())),
                _ => Ok(SynthesizedAudio {
                    bytes: text.as_bytes().to_vec(),
                    format: AudioFormat::Mp3,
                }),
            }
        }
    }

    fn utterance(index: u64, text: &str) -> Utterance {
        Utterance {
            sequence_index: index,
            start: Duration::from_secs(index * 30),
            end: Duration::from_secs(index * 30 + 10),
            text: text.to_string(),
            speaker: Speaker::Commentator1,
            interval: index as usize,
            source_events: Vec::new(),
        }
    }

    async fn run_stage(
        synthesizer: Option<Arc<dyn Synthesizer>>,
        texts: &[&str],
    ) -> (AudioReport, Vec<NarrationAudio>, Vec<String>) {
        let cancel = CancellationToken::new();
        let (feed_tx, mut feed_rx) = mpsc::channel(16);
        let reporter = Reporter::new(feed_tx, cancel.clone());
        let retry = RetryPolicy::new(
            &RetrySection {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 1,
                jitter_ms: 0,
                mux_attempts: 1,
            },
            Duration::from_secs(5),
        );
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        for (index, text) in texts.iter().enumerate() {
            in_tx
                .send(StageMessage::Item(utterance(index as u64, text)))
                .await
                .unwrap();
        }
        in_tx.send(StageMessage::EndOfStream).await.unwrap();

        let stage = AudioStage::new(synthesizer, retry, reporter, 2);
        let report = stage.run(in_rx, out_tx, cancel).await;

        let mut audio = Vec::new();
        let mut ended = false;
        while let Ok(message) = out_rx.try_recv() {
            match message {
                StageMessage::Item((_, narration)) => audio.push(narration),
                StageMessage::EndOfStream => ended = true,
            }
        }
        assert!(ended);
        audio.sort_by_key(|narration| narration.sequence_index);

        let mut warnings = Vec::new();
        while let Ok(event) = feed_rx.try_recv() {
            if let ProgressEvent::Warning { message } = event {
                warnings.push(message);
            }
        }
        (report, audio, warnings)
    }

    #[tokio::test]
    async fn panicking_synthesis_still_forwards_its_utterance() {
        let (report, audio, warnings) = run_stage(
            Some(Arc::new(FlakySynthesizer)),
            &["kick off", "boom", "quota", "corner"],
        )
        .await;

        assert_eq!(audio.len(), 4);
        let present: Vec<bool> = audio.iter().map(|a| a.track.is_present()).collect();
        assert_eq!(present, vec![true, false, false, true]);
        assert_eq!(
            audio[1].track,
            NarrationTrack::absent("synthesis task failed")
        );
        assert_eq!(report, AudioReport { synthesized: 2, absent: 2 });
        assert!(warnings
            .iter()
            .any(|m| m.starts_with("Narration unavailable for utterance 1 (synthesis task failed)")));
        assert!(warnings
            .iter()
            .any(|m| m.starts_with("Narration unavailable for utterance 2 (quota exceeded)")));
    }

    #[tokio::test]
    async fn passthrough_marks_every_utterance_absent() {
        let (report, audio, warnings) = run_stage(None, &["one", "two", "three"]).await;
        assert_eq!(audio.len(), 3);
        assert!(audio.iter().all(|a| !a.track.is_present()));
        assert_eq!(report, AudioReport { synthesized: 0, absent: 3 });
        assert_eq!(warnings.len(), 1);
    }
}
