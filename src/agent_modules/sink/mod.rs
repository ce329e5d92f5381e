use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::reading::Reading;

pub mod influx;

pub use influx::InfluxSink;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("Request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("Sink rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },
    #[error("Sink reported a conflict: {0}")]
    Conflict(String),
    #[error("Sink rejected the batch ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Sink server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("Invalid sink configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SinkError::Timeout(err)
        } else {
            SinkError::Network(err)
        }
    }
}

/// A remote time-series store that accepts tagged, timestamped points in batches.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Writes every point in one blocking call.
    async fn write_points(&self, points: &[Point]) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, f64)>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Builds the `status` point for one reading, stamped with its capture time.
    pub fn from_reading(measurement: &str, device_name: &str, reading: &Reading) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: vec![("device".to_string(), device_name.to_string())],
            fields: vec![
                ("cpu_usage".to_string(), reading.cpu_usage),
                ("cpu_temperature".to_string(), reading.cpu_temperature),
                ("memory_usage".to_string(), reading.memory_usage),
            ],
            timestamp: reading.captured_at,
        }
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    /// Renders the point as one line of InfluxDB line protocol with a
    /// nanosecond timestamp. Non-finite fields are left out; `None` when no
    /// field remains.
    pub fn to_line_protocol(&self) -> Option<String> {
        let fields: Vec<String> = self
            .fields
            .iter()
            .filter(|(_, value)| value.is_finite())
            .map(|(key, value)| format!("{}={}", escape_key(key), value))
            .collect();
        if fields.is_empty() {
            return None;
        }

        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }
        line.push(' ');
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&timestamp_nanos(&self.timestamp).to_string());
        Some(line)
    }
}

fn timestamp_nanos(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1_000))
}

fn escape_measurement(raw: &str) -> String {
    escape(raw, &[',', ' '])
}

/// Escaping shared by tag keys, tag values and field keys.
fn escape_key(raw: &str) -> String {
    escape(raw, &[',', '=', ' '])
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading() -> Reading {
        Reading::new(
            12.5,
            48.25,
            63.0,
            Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap(),
        )
    }

    #[test]
    fn test_point_carries_reading_fields_and_capture_time() {
        let point = Point::from_reading("status", "tvbox-07", &reading());

        assert_eq!(point.measurement, "status");
        assert_eq!(point.tags, vec![("device".to_string(), "tvbox-07".to_string())]);
        assert_eq!(point.field("cpu_usage"), Some(12.5));
        assert_eq!(point.field("cpu_temperature"), Some(48.25));
        assert_eq!(point.field("memory_usage"), Some(63.0));
        assert_eq!(point.timestamp, reading().captured_at);
    }

    #[test]
    fn test_line_protocol_rendering() {
        let point = Point::from_reading("status", "tvbox-07", &reading());

        assert_eq!(
            point.to_line_protocol().unwrap(),
            "status,device=tvbox-07 cpu_usage=12.5,cpu_temperature=48.25,memory_usage=63 1741944413000000000"
        );
    }

    #[test]
    fn test_line_protocol_escapes_tags() {
        let point = Point::from_reading("tv status", "living room,box=1", &reading());
        let line = point.to_line_protocol().unwrap();

        assert!(line.starts_with(r"tv\ status,device=living\ room\,box\=1 cpu_usage="));
    }

    #[test]
    fn test_line_protocol_skips_non_finite_fields() {
        let mut r = reading();
        r.cpu_temperature = f64::NAN;
        let line = Point::from_reading("status", "box", &r).to_line_protocol().unwrap();
        assert!(!line.contains("cpu_temperature"));

        r.cpu_usage = f64::INFINITY;
        r.memory_usage = f64::NAN;
        assert_eq!(Point::from_reading("status", "box", &r).to_line_protocol(), None);
    }
}
