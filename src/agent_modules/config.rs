use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Device label used when none is configured.
pub const DEFAULT_DEVICE_NAME: &str = "tvbox-unknown";

const DEFAULT_SAMPLE_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_UPLOAD_INTERVAL_SECONDS: u64 = 15 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Tag attached to every uploaded point.
    pub device_name: String,
    pub sampler: SamplerConfig,
    pub uploader: UploaderConfig,
    pub influx: InfluxConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_seconds: u64,
    /// Window over which CPU utilization is averaged.
    pub cpu_window_ms: u64,
    /// Milli-degree Celsius sensor file.
    pub temperature_path: PathBuf,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_SAMPLE_INTERVAL_SECONDS,
            cpu_window_ms: 1000,
            temperature_path: PathBuf::from("/sys/class/hwmon/hwmon0/temp1_input"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UploaderConfig {
    pub interval_seconds: u64,
    /// Drain the queue one last time when the agent shuts down.
    pub final_flush_on_shutdown: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_UPLOAD_INTERVAL_SECONDS,
            final_flush_on_shutdown: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
    pub request_timeout_seconds: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            measurement: "status".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

// Keeps the token out of logged config dumps.
impl std::fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("token", &if self.token.is_empty() { "<unset>" } else { "<redacted>" })
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("measurement", &self.measurement)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory of the sled database holding pending readings.
    pub path: PathBuf,
    pub tree: String,
    /// Flush to disk after every write so an acknowledged append survives a crash.
    pub flush_on_write: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data").join("queue"),
            tree: "tvbox_status".to_string(),
            flush_on_write: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: PathBuf::from("logs"),
        }
    }
}

impl AgentConfig {
    /// Loads the TOML file at `path`. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Applies the deployment variables `INFLUX_ADDR`, `INFLUX_TOKEN`,
    /// `INFLUX_ORG`, `INFLUX_BUCKET` and `DEVICE_NAME` on top of the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("INFLUX_ADDR") {
            self.influx.url = url;
        }
        if let Some(token) = non_empty("INFLUX_TOKEN") {
            self.influx.token = token;
        }
        if let Some(org) = non_empty("INFLUX_ORG") {
            self.influx.org = org;
        }
        if let Some(bucket) = non_empty("INFLUX_BUCKET") {
            self.influx.bucket = bucket;
        }
        if let Some(device_name) = non_empty("DEVICE_NAME") {
            self.device_name = device_name;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("influx.url", &self.influx.url),
            ("influx.org", &self.influx.org),
            ("influx.bucket", &self.influx.bucket),
            ("influx.measurement", &self.influx.measurement),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        if self.influx.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "influx.request_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.queue.tree.is_empty() {
            return Err(ConfigError::Invalid("queue.tree must not be empty".to_string()));
        }
        Ok(())
    }

    /// Configured device label, or [`DEFAULT_DEVICE_NAME`] when blank.
    pub fn effective_device_name(&self) -> &str {
        let name = self.device_name.trim();
        if name.is_empty() {
            DEFAULT_DEVICE_NAME
        } else {
            name
        }
    }

    pub fn sample_interval_seconds(&self) -> u64 {
        non_zero_or(self.sampler.interval_seconds, DEFAULT_SAMPLE_INTERVAL_SECONDS)
    }

    pub fn upload_interval_seconds(&self) -> u64 {
        non_zero_or(self.uploader.interval_seconds, DEFAULT_UPLOAD_INTERVAL_SECONDS)
    }
}

fn non_zero_or(value: u64, fallback: u64) -> u64 {
    if value > 0 {
        value
    } else {
        fallback
    }
}
