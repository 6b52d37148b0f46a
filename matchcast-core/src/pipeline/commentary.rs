use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collaborator::{GenerationRequest, Generator, TimingConstraints};
use crate::model::{EventBatch, Interval, Speaker, StageMessage, Utterance, UtteranceDraft};
use crate::retry::RetryPolicy;
use crate::timecode::{format_hms, parse_timecode};

use super::session::Reporter;
use super::send_or_cancel;

/// End of the most recently emitted utterance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviousUtterance {
    pub end: Duration,
    pub interval: usize,
}

/// A draft that survived normalisation and is waiting for an index.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalisedDraft {
    pub start: Duration,
    pub end: Duration,
    pub text: String,
    pub speaker: Speaker,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Normalised {
    pub drafts: Vec<NormalisedDraft>,
    pub warnings: Vec<String>,
}

/// Deterministic timing rules applied to generated drafts.
#[derive(Debug, Clone, Copy)]
pub struct Normaliser {
    min_duration: Duration,
    max_duration: Duration,
    min_gap: Duration,
    max_gap: Duration,
    words_per_second: f64,
    video_duration: Duration,
}

impl Normaliser {
    pub fn new(constraints: &TimingConstraints, video_duration: Duration) -> Self {
        Self {
            min_duration: Duration::from_secs_f64(constraints.min_duration_seconds),
            max_duration: Duration::from_secs_f64(constraints.max_duration_seconds),
            min_gap: Duration::from_secs_f64(constraints.min_gap_seconds),
            max_gap: Duration::from_secs_f64(constraints.max_gap_seconds),
            words_per_second: constraints.words_per_second,
            video_duration,
        }
    }

    pub fn word_budget(&self, duration: Duration) -> usize {
        (self.words_per_second * duration.as_secs_f64()).floor() as usize
    }

    pub fn normalise(
        &self,
        drafts: Vec<UtteranceDraft>,
        interval: &Interval,
        mut previous: Option<PreviousUtterance>,
    ) -> Normalised {
        let mut output = Normalised::default();
        let mut parsed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            match validate_draft(&draft) {
                Ok(valid) => parsed.push(valid),
                Err(reason) => output.warnings.push(format!(
                    "Dropped commentary in interval {}: {reason}",
                    interval.index + 1
                )),
            }
        }
        parsed.sort_by_key(|draft| draft.start);

        for mut draft in parsed {
            draft.end = draft.end.min(self.video_duration);

            let mut gap_warning = None;
            if let Some(prev) = previous.filter(|prev| {
                prev.interval == interval.index || prev.interval + 1 == interval.index
            }) {
                let earliest = prev.end + self.min_gap;
                if draft.start < earliest {
                    debug!(
                        from = %format_hms(draft.start),
                        to = %format_hms(earliest),
                        "moving commentary start to respect minimum gap"
                    );
                    draft.start = earliest;
                } else if draft.start - prev.end > self.max_gap {
                    gap_warning = Some(format!(
                        "Gap of {:.1}s before commentary at {} exceeds {:.1}s",
                        (draft.start - prev.end).as_secs_f64(),
                        format_hms(draft.start),
                        self.max_gap.as_secs_f64()
                    ));
                }
            }

            if draft.end > draft.start && draft.end - draft.start > self.max_duration {
                draft.end = draft.start + self.max_duration;
            }

            let duration = draft.end.saturating_sub(draft.start);
            if duration < self.min_duration {
                output.warnings.push(format!(
                    "Dropped commentary at {}: {:.1}s is shorter than {:.1}s",
                    format_hms(draft.start),
                    duration.as_secs_f64(),
                    self.min_duration.as_secs_f64()
                ));
                continue;
            }

            let budget = self.word_budget(duration);
            if draft.text.split_whitespace().count() > budget {
                let truncated = truncate_to_budget(&draft.text, budget);
                debug!(
                    at = %format_hms(draft.start),
                    budget,
                    "truncated commentary to word budget"
                );
                draft.text = truncated;
            }
            if draft.text.trim().is_empty() {
                output.warnings.push(format!(
                    "Dropped commentary at {}: no words fit the budget",
                    format_hms(draft.start)
                ));
                continue;
            }

            output.warnings.extend(gap_warning);
            previous = Some(PreviousUtterance {
                end: draft.end,
                interval: interval.index,
            });
            output.drafts.push(draft);
        }
        output
    }
}

fn validate_draft(draft: &UtteranceDraft) -> Result<NormalisedDraft, String> {
    let start = parse_timecode(&draft.start_time).map_err(|err| err.to_string())?;
    let end = parse_timecode(&draft.end_time).map_err(|err| err.to_string())?;
    if end <= start {
        return Err(format!(
            "end {} is not after start {}",
            draft.end_time, draft.start_time
        ));
    }
    let text = draft.text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return Err("empty text".to_string());
    }
    let speaker = Speaker::parse(&draft.speaker)
        .ok_or_else(|| format!("unknown speaker '{}'", draft.speaker))?;
    Ok(NormalisedDraft {
        start,
        end,
        text,
        speaker,
    })
}

/// Keeps at most `budget` words, ending on the last complete sentence when
/// the kept words contain one.
pub fn truncate_to_budget(text: &str, budget: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= budget {
        return words.join(" ");
    }
    let kept = &words[..budget];
    let sentence_end = kept
        .iter()
        .rposition(|word| word.ends_with(&['.', '!', '?'][..]));
    match sentence_end {
        Some(last) => kept[..=last].join(" "),
        None => kept.join(" "),
    }
}

pub struct CommentaryStage {
    generator: Arc<dyn Generator>,
    retry: RetryPolicy,
    reporter: Reporter,
    constraints: TimingConstraints,
    video_duration: Duration,
    context: Option<String>,
}

impl CommentaryStage {
    pub fn new(
        generator: Arc<dyn Generator>,
        retry: RetryPolicy,
        reporter: Reporter,
        constraints: TimingConstraints,
        video_duration: Duration,
        context: Option<String>,
    ) -> Self {
        Self {
            generator,
            retry,
            reporter,
            constraints,
            video_duration,
            context,
        }
    }

    /// Returns every utterance emitted downstream.
    pub async fn run(
        self,
        mut input: mpsc::Receiver<StageMessage<EventBatch>>,
        output: mpsc::Sender<StageMessage<Utterance>>,
        cancel: CancellationToken,
    ) -> Vec<Utterance> {
        let normaliser = Normaliser::new(&self.constraints, self.video_duration);
        let mut emitted: Vec<Utterance> = Vec::new();
        let mut previous: Option<PreviousUtterance> = None;
        let mut next_index = 0u64;

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return emitted,
                message = input.recv() => message,
            };
            let batch = match message {
                Some(StageMessage::Item(batch)) => batch,
                Some(StageMessage::EndOfStream) | None => break,
            };
            if batch.events.is_empty() {
                debug!(interval = batch.interval.index, "no events, skipping generation");
                continue;
            }

            let request = GenerationRequest {
                interval: batch.interval,
                events: batch.events.clone(),
                constraints: self.constraints,
                previous_end: previous.map(|prev| prev.end),
                video_duration: self.video_duration,
                context: self.context.clone(),
            };
            let label = format!("generate interval {}", batch.interval.index + 1);
            let drafts = match self
                .retry
                .run(&label, &cancel, |_| self.generator.generate(&request))
                .await
            {
                Ok(outcome) => outcome.result,
                Err(err) if err.is_cancelled() => return emitted,
                Err(err) => {
                    self.reporter
                        .warning(format!(
                            "Commentary generation failed for interval {}: {err}",
                            batch.interval.index + 1
                        ))
                        .await;
                    continue;
                }
            };

            let normalised = normaliser.normalise(drafts, &batch.interval, previous);
            for warning in normalised.warnings {
                self.reporter.warning(warning).await;
            }
            for draft in normalised.drafts {
                let utterance = Utterance {
                    sequence_index: next_index,
                    start: draft.start,
                    end: draft.end,
                    text: draft.text,
                    speaker: draft.speaker,
                    interval: batch.interval.index,
                    source_events: batch.events.clone(),
                };
                next_index += 1;
                previous = Some(PreviousUtterance {
                    end: utterance.end,
                    interval: utterance.interval,
                });
                emitted.push(utterance.clone());
                if !send_or_cancel(&output, StageMessage::Item(utterance), &cancel).await {
                    return emitted;
                }
            }
        }

        info!(utterances = emitted.len(), "commentary stage finished");
        send_or_cancel(&output, StageMessage::EndOfStream, &cancel).await;
        emitted
    }
}
