use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use super::queue::{self, QueueError, ReadingQueue};
use super::reading::Reading;
use super::sink::{MetricsSink, Point, SinkError};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to drain reading queue: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing was queued; no network call was made.
    Idle,
    /// The batch was written; `skipped` corrupt entries were dropped.
    Uploaded { points: usize, skipped: usize },
    /// Every drained entry was unreadable; no network call was made.
    Discarded { skipped: usize },
    /// The sink write failed and the batch went back to the head of the queue.
    Requeued { points: usize, skipped: usize },
}

/// Consumer side of the pipeline.
///
/// Each cycle drains the queue up to its length at the start of the cycle and
/// writes every decodable entry to the sink in one batch. When the write
/// fails, the drained entries are put back at the queue head in their original
/// order, so delivery is at-least-once. Entries that fail to decode are logged
/// and dropped.
pub struct Uploader<S> {
    queue: Arc<dyn ReadingQueue>,
    sink: S,
    device_name: String,
    measurement: String,
}

impl<S: MetricsSink> Uploader<S> {
    pub fn new(
        queue: Arc<dyn ReadingQueue>,
        sink: S,
        device_name: impl Into<String>,
        measurement: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            sink,
            device_name: device_name.into(),
            measurement: measurement.into(),
        }
    }

    pub async fn run_cycle(&self) -> Result<UploadOutcome, UploadError> {
        let drained = queue::drain_blocking(&self.queue).await?;
        if drained.is_empty() {
            return Ok(UploadOutcome::Idle);
        }

        let mut points = Vec::with_capacity(drained.len());
        let mut payloads = Vec::with_capacity(drained.len());
        let mut skipped = 0;
        for raw in drained {
            match Reading::decode(&raw) {
                Ok(reading) => {
                    points.push(Point::from_reading(&self.measurement, &self.device_name, &reading));
                    payloads.push(raw);
                }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, bytes = raw.len(), "Discarding unreadable queued entry.");
                }
            }
        }

        if points.is_empty() {
            warn!(skipped, "Every drained entry was unreadable; nothing to upload.");
            return Ok(UploadOutcome::Discarded { skipped });
        }

        let count = points.len();
        info!(points = count, skipped, device = %self.device_name, "Uploading status batch.");
        match self.sink.write_points(&points).await {
            Ok(()) => {
                info!(points = count, "Status batch uploaded.");
                Ok(UploadOutcome::Uploaded { points: count, skipped })
            }
            Err(e) => {
                self.requeue_after_failure(payloads, &e).await?;
                Ok(UploadOutcome::Requeued { points: count, skipped })
            }
        }
    }

    async fn requeue_after_failure(&self, payloads: Vec<Vec<u8>>, cause: &SinkError) -> Result<(), UploadError> {
        let count = payloads.len();
        match queue::requeue_front_blocking(&self.queue, payloads).await {
            Ok(()) => {
                warn!(error = %cause, requeued = count, "Failed to write status batch; kept it for the next cycle.");
                Ok(())
            }
            Err(queue_err) => {
                error!(
                    error = %cause,
                    queue_error = %queue_err,
                    lost = count,
                    "Failed to write status batch and could not put it back in the queue."
                );
                Err(queue_err.into())
            }
        }
    }
}
