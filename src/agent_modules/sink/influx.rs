use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use super::{MetricsSink, Point, SinkError};
use crate::agent_modules::config::InfluxConfig;
use crate::version;

/// Writes batches to the InfluxDB v2 `/api/v2/write` endpoint as line protocol.
pub struct InfluxSink {
    client: Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        if config.request_timeout_seconds == 0 {
            return Err(SinkError::InvalidConfiguration(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        Self::with_timeout(config, Duration::from_secs(config.request_timeout_seconds))
    }

    pub fn with_timeout(config: &InfluxConfig, timeout: Duration) -> Result<Self, SinkError> {
        let base = config.url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(SinkError::InvalidConfiguration("InfluxDB url is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(version::user_agent())
            .build()
            .map_err(|e| SinkError::InvalidConfiguration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            write_url: format!("{base}/api/v2/write"),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl MetricsSink for InfluxSink {
    async fn write_points(&self, points: &[Point]) -> Result<(), SinkError> {
        let lines: Vec<String> = points.iter().filter_map(Point::to_line_protocol).collect();
        if lines.len() < points.len() {
            warn!(
                dropped = points.len() - lines.len(),
                "Dropping points without any finite field."
            );
        }
        if lines.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.join("\n"));
        if !self.token.is_empty() {
            request = request.header(header::AUTHORIZATION, format!("Token {}", self.token));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), lines = lines.len(), "Batch accepted by InfluxDB.");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        Err(classify_status(status, body))
    }
}

/// Maps a non-success write response onto the sink error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: String) -> SinkError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SinkError::Unauthorized {
            status: status.as_u16(),
            body,
        },
        StatusCode::CONFLICT => SinkError::Conflict(body),
        s if s.is_server_error() => SinkError::Server {
            status: s.as_u16(),
            body,
        },
        s => SinkError::Rejected {
            status: s.as_u16(),
            body,
        },
    }
}
