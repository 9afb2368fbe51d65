//! Configuration for the Sensus collector.

use crate::probe::listening::DEFAULT_MAX_DATA_PER_SECOND;
use crate::probe::polling::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Directory name used under the platform config and data directories.
const APP_DIR: &str = "sensus-collector";

/// Main configuration for the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the protocol the collector runs
    pub protocol_name: String,

    /// Path for buffered data and persisted totals
    pub data_path: PathBuf,

    /// Location probe settings
    #[serde(default)]
    pub location: LocationConfig,

    /// Survey script settings
    #[serde(default)]
    pub scripts: ScriptConfig,

    /// Whether collection is currently paused
    #[serde(default)]
    pub paused: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            protocol_name: "Default Protocol".to_string(),
            data_path: data_dir,
            location: LocationConfig::default(),
            scripts: ScriptConfig::default(),
            paused: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }
}

/// How location probes obtain readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// Readings are pushed by the receiver as they arrive
    #[default]
    Listening,
    /// Readings are requested on a timer
    Polling,
}

impl std::fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeMode::Listening => write!(f, "listening"),
            ProbeMode::Polling => write!(f, "polling"),
        }
    }
}

/// Location probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub enabled: bool,
    pub mode: ProbeMode,

    /// Listening probes only
    pub max_data_per_second: f64,

    /// Polling probes only
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ProbeMode::Listening,
            max_data_per_second: DEFAULT_MAX_DATA_PER_SECOND,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl LocationConfig {
    /// How old a cached fix may be and still answer a poll.
    ///
    /// Polling probes reuse a fix taken within the last poll interval instead
    /// of waiting for the next one. Listening probes never read the cache.
    pub fn max_reading_age(&self) -> Option<Duration> {
        match self.mode {
            ProbeMode::Listening => None,
            ProbeMode::Polling => Some(self.poll_interval),
        }
    }
}

/// Survey script settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Script template scheduled by `sensus start`
    #[serde(default)]
    pub template_path: Option<PathBuf>,

    /// Bound on each prompt wait; unset waits indefinitely
    #[serde(default, with = "optional_duration_millis")]
    pub prompt_timeout: Option<Duration>,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
