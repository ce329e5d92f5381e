//! The two periodic workers. Each loop runs its worker inline, so invocations
//! of the same worker never overlap; ticks missed while a run is in progress
//! are skipped.
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::metrics::{HostMetricsSource, Sampler};
use super::sink::MetricsSink;
use super::uploader::{UploadOutcome, Uploader};

fn periodic(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

pub async fn sampler_loop<M: HostMetricsSource>(
    mut sampler: Sampler<M>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut interval = periodic(period);
    info!(interval_seconds = period.as_secs(), "Sampler task started.");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received, stopping sampler.");
                break;
            }

            _ = interval.tick() => {
                if let Err(e) = sampler.run_cycle().await {
                    error!(error = %e, "Sampling cycle failed; retrying on the next tick.");
                }
            }
        }
    }
    info!("Sampler task stopped.");
}

pub async fn upload_loop<S: MetricsSink>(
    uploader: Uploader<S>,
    period: Duration,
    final_flush: bool,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut interval = periodic(period);
    info!(interval_seconds = period.as_secs(), "Uploader task started.");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received, stopping uploader.");
                break;
            }

            _ = interval.tick() => {
                run_upload_cycle(&uploader).await;
            }
        }
    }

    if final_flush {
        info!("Flushing queued readings before exit.");
        run_upload_cycle(&uploader).await;
    }
    info!("Uploader task stopped.");
}

async fn run_upload_cycle<S: MetricsSink>(uploader: &Uploader<S>) {
    match uploader.run_cycle().await {
        Ok(UploadOutcome::Idle) => info!("No queued readings to upload."),
        Ok(UploadOutcome::Uploaded { .. }) | Ok(UploadOutcome::Discarded { .. }) => {}
        Ok(UploadOutcome::Requeued { points, .. }) => {
            warn!(requeued = points, "Upload deferred to the next cycle.");
        }
        Err(e) => error!(error = %e, "Upload cycle failed; retrying on the next tick."),
    }
}

/// Spawns the sampler and uploader tasks. They share nothing but the queue
/// held by both workers and stop when `shutdown_rx` fires.
pub fn spawn_pipeline<M, S>(
    sampler: Sampler<M>,
    uploader: Uploader<S>,
    sample_period: Duration,
    upload_period: Duration,
    final_flush: bool,
    shutdown_rx: watch::Receiver<()>,
) -> Vec<JoinHandle<()>>
where
    M: HostMetricsSource + 'static,
    S: MetricsSink + 'static,
{
    if sample_period >= upload_period {
        warn!(
            sample_seconds = sample_period.as_secs(),
            upload_seconds = upload_period.as_secs(),
            "Sample interval is not shorter than the upload interval; batches will hold at most one reading."
        );
    }

    vec![
        tokio::spawn(sampler_loop(sampler, sample_period, shutdown_rx.clone())),
        tokio::spawn(upload_loop(uploader, upload_period, final_flush, shutdown_rx)),
    ]
}
