use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReadingError {
    #[error("Failed to encode reading: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode queued reading: {0}")]
    Decode(#[source] serde_json::Error),
}

/// One timestamped bundle of the sampled host metrics.
///
/// The queued form is field-named JSON, so entries written by an older
/// process stay decodable after a restart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reading {
    /// CPU utilization in percent (0-100).
    pub cpu_usage: f64,
    /// CPU temperature in degrees Celsius.
    pub cpu_temperature: f64,
    /// Used physical memory in percent (0-100).
    pub memory_usage: f64,
    /// Moment the measurements were taken.
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        cpu_usage: f64,
        cpu_temperature: f64,
        memory_usage: f64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cpu_usage,
            cpu_temperature,
            memory_usage,
            captured_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ReadingError> {
        serde_json::to_vec(self).map_err(ReadingError::Encode)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ReadingError> {
        serde_json::from_slice(raw).map_err(ReadingError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encoded_reading_uses_field_names() {
        let captured_at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let reading = Reading::new(12.5, 48.2, 63.0, captured_at);

        let value: serde_json::Value = serde_json::from_slice(&reading.encode().unwrap()).unwrap();

        assert_eq!(value["cpu_usage"], 12.5);
        assert_eq!(value["cpu_temperature"], 48.2);
        assert_eq!(value["memory_usage"], 63.0);
        assert_eq!(value["captured_at"], "2025-03-14T09:26:53Z");
    }

    #[test]
    fn test_decode_ignores_field_order() {
        let raw = br#"{"captured_at":"2025-03-14T09:26:53Z","memory_usage":40.0,"cpu_temperature":51.5,"cpu_usage":7.25}"#;

        let reading = Reading::decode(raw).unwrap();

        assert_eq!(reading.cpu_usage, 7.25);
        assert_eq!(reading.cpu_temperature, 51.5);
        assert_eq!(reading.memory_usage, 40.0);
        assert_eq!(
            reading.captured_at,
            Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
        );
    }

    #[test]
    fn test_decode_rejects_corrupt_payload() {
        assert!(matches!(
            Reading::decode(b"{not json"),
            Err(ReadingError::Decode(_))
        ));
        assert!(matches!(
            Reading::decode(br#"{"cpu_usage":1.0}"#),
            Err(ReadingError::Decode(_))
        ));
    }
}
