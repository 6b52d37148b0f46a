use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collaborator::{Detector, PreparedSource};
use crate::model::{Event, EventBatch, Interval, StageMessage};
use crate::retry::RetryPolicy;

use super::send_or_cancel;
use super::session::{PipelineSession, Reporter};

/// Walks the intervals in order, one detection per interval, and pushes each
/// batch downstream before moving on.
pub struct EventSource {
    detector: Arc<dyn Detector>,
    source: PreparedSource,
    retry: RetryPolicy,
    reporter: Reporter,
    session: Arc<PipelineSession>,
}

impl EventSource {
    pub fn new(
        detector: Arc<dyn Detector>,
        source: PreparedSource,
        retry: RetryPolicy,
        reporter: Reporter,
        session: Arc<PipelineSession>,
    ) -> Self {
        Self {
            detector,
            source,
            retry,
            reporter,
            session,
        }
    }

    /// Returns all detected events, in interval order.
    pub async fn run(
        self,
        output: mpsc::Sender<StageMessage<EventBatch>>,
        cancel: CancellationToken,
    ) -> Vec<Event> {
        let intervals: Vec<Interval> = self.session.intervals().to_vec();
        let total = intervals.len();
        let mut detected = Vec::new();

        for interval in intervals {
            if cancel.is_cancelled() {
                return detected;
            }
            let label = format!("detect interval {}", interval.index + 1);
            let events = match self
                .retry
                .run(&label, &cancel, |_| self.detector.detect(&self.source, &interval))
                .await
            {
                Ok(outcome) => outcome.result,
                Err(err) if err.is_cancelled() => return detected,
                Err(err) => {
                    self.reporter
                        .warning(format!(
                            "Event detection failed for interval {}/{total}, continuing without it: {err}",
                            interval.index + 1
                        ))
                        .await;
                    Vec::new()
                }
            };

            self.reporter
                .status(
                    format!(
                        "Analyzed interval {}/{total} ({} events)",
                        interval.index + 1,
                        events.len()
                    ),
                    self.session.progress(),
                )
                .await;
            detected.extend(events.iter().cloned());

            let batch = EventBatch { interval, events };
            if !send_or_cancel(&output, StageMessage::Item(batch), &cancel).await {
                return detected;
            }
        }

        info!(intervals = total, events = detected.len(), "event detection finished");
        send_or_cancel(&output, StageMessage::EndOfStream, &cancel).await;
        detected
    }
}
