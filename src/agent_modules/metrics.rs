use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;
use tracing::debug;

use super::queue::{self, QueueError, ReadingQueue};
use super::reading::{Reading, ReadingError};

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {what} from {raw:?}")]
    Parse { what: &'static str, raw: String },
    #[error("Metric unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum SampleCycleError {
    #[error("Measurement failed: {0}")]
    Measurement(#[from] MetricsError),
    #[error(transparent)]
    Encode(#[from] ReadingError),
    #[error("Failed to queue reading: {0}")]
    Queue(#[from] QueueError),
}

/// Where instantaneous host metrics come from.
#[async_trait]
pub trait HostMetricsSource: Send {
    /// CPU utilization in percent, averaged over the source's measurement window.
    async fn cpu_usage(&mut self) -> Result<f64, MetricsError>;

    /// CPU temperature in degrees Celsius.
    async fn cpu_temperature(&mut self) -> Result<f64, MetricsError>;

    /// Used physical memory in percent.
    async fn memory_usage(&mut self) -> Result<f64, MetricsError>;
}

/// Reads CPU and memory through sysinfo and the temperature from a
/// milli-degree sensor file such as `/sys/class/hwmon/hwmon0/temp1_input`.
pub struct SysinfoSource {
    sys: System,
    cpu_window: Duration,
    temperature_path: PathBuf,
}

impl SysinfoSource {
    pub fn new(cpu_window: Duration, temperature_path: impl Into<PathBuf>) -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
                .with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        Self {
            sys,
            // sysinfo needs at least this long between refreshes to compute usage.
            cpu_window: cpu_window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
            temperature_path: temperature_path.into(),
        }
    }
}

#[async_trait]
impl HostMetricsSource for SysinfoSource {
    async fn cpu_usage(&mut self) -> Result<f64, MetricsError> {
        self.sys.refresh_cpu_usage();
        tokio::time::sleep(self.cpu_window).await;
        self.sys.refresh_cpu_usage();

        if self.sys.cpus().is_empty() {
            return Err(MetricsError::Unavailable("no CPUs reported".to_string()));
        }
        let usage = f64::from(self.sys.global_cpu_usage());
        if !usage.is_finite() {
            return Err(MetricsError::Unavailable(format!("CPU usage is {usage}")));
        }
        Ok(usage)
    }

    async fn cpu_temperature(&mut self) -> Result<f64, MetricsError> {
        let raw = tokio::fs::read_to_string(&self.temperature_path)
            .await
            .map_err(|source| MetricsError::Io {
                path: self.temperature_path.clone(),
                source,
            })?;
        parse_millidegrees(&raw)
    }

    async fn memory_usage(&mut self) -> Result<f64, MetricsError> {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return Err(MetricsError::Unavailable("total memory reported as 0".to_string()));
        }
        Ok(self.sys.used_memory() as f64 / total as f64 * 100.0)
    }
}

/// Parses a sensor value in milli-degrees Celsius, e.g. `"48250\n"` -> 48.25.
pub fn parse_millidegrees(raw: &str) -> Result<f64, MetricsError> {
    let trimmed = raw.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v / 1000.0)
        .ok_or_else(|| MetricsError::Parse {
            what: "CPU temperature",
            raw: trimmed.to_string(),
        })
}

/// Producer side of the pipeline: measures the host and queues one reading per cycle.
pub struct Sampler<M> {
    source: M,
    queue: Arc<dyn ReadingQueue>,
}

impl<M: HostMetricsSource> Sampler<M> {
    pub fn new(source: M, queue: Arc<dyn ReadingQueue>) -> Self {
        Self { source, queue }
    }

    /// Takes all three measurements. Any failure abandons the whole reading.
    pub async fn sample(&mut self) -> Result<Reading, MetricsError> {
        let cpu_usage = self.source.cpu_usage().await?;
        let cpu_temperature = self.source.cpu_temperature().await?;
        let memory_usage = self.source.memory_usage().await?;

        Ok(Reading::new(cpu_usage, cpu_temperature, memory_usage, Utc::now()))
    }

    /// One sampler tick: measure, then append exactly one entry to the queue.
    pub async fn run_cycle(&mut self) -> Result<Reading, SampleCycleError> {
        let reading = self.sample().await?;
        let encoded = reading.encode()?;
        queue::append_blocking(&self.queue, encoded).await?;
        debug!(
            cpu_usage = reading.cpu_usage,
            cpu_temperature = reading.cpu_temperature,
            memory_usage = reading.memory_usage,
            captured_at = %reading.captured_at,
            "Queued reading."
        );
        Ok(reading)
    }
}
