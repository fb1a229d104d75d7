//! Configuration for the shift report agent.
//!
//! Read once at startup from a TOML file and handed to each component.

use crate::core::error::PreconditionError;
use crate::core::schedule::{format_duration, parse_anchor, parse_duration};
use crate::influx::InfluxConfig;
use crate::notify::SmtpConfig;
use chrono::{Duration, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default log level (`RUST_LOG` takes precedence)
    #[serde(default = "default_logging")]
    pub logging: String,

    /// Path for storing run statistics
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Time-series store connection
    #[serde(default)]
    pub source: InfluxConfig,

    /// Schedule and report output
    #[serde(default)]
    pub report: ReportConfig,

    /// Email delivery
    #[serde(default)]
    pub email: EmailConfig,
}

fn default_logging() -> String {
    "info".to_string()
}

fn default_data_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shift-report")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: default_logging(),
            data_path: default_data_path(),
            source: InfluxConfig::default(),
            report: ReportConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

/// When reports run and what they cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Length of the trailing query window
    #[serde(with = "duration_serde")]
    pub window: Duration,

    /// Time between fires
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Daily anchor time of day
    #[serde(with = "anchor_serde")]
    pub time: NaiveTime,

    /// Directory report files are written to
    pub output_dir: PathBuf,

    /// IANA timezone for dates shown in reports
    pub timezone: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            window: Duration::days(1),
            interval: Duration::hours(1),
            time: NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default(),
            output_dir: PathBuf::from("out"),
            timezone: "UTC".to_string(),
        }
    }
}

impl ReportConfig {
    /// Parsed report timezone.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone '{}'", self.timezone)))
    }
}

/// Email delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    /// Sender; defaults to the SMTP username
    pub from: Option<String>,
    pub to: Vec<String>,
    pub smtp: SmtpConfig,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            from: None,
            to: Vec::new(),
            smtp: SmtpConfig::default(),
        }
    }
}

impl EmailConfig {
    /// Notification runs only when enabled and someone is listening.
    pub fn notifications_enabled(&self) -> bool {
        self.enabled && self.to.iter().any(|t| !t.trim().is_empty())
    }

    pub fn recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => Self::load_from(p)?,
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::load_from(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the default configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shift-report")
            .join("config.toml")
    }

    /// Path of the persisted run statistics.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.report.interval <= Duration::zero() {
            return Err(PreconditionError::NonPositiveInterval.into());
        }
        if self.report.window <= Duration::zero() {
            return Err(ConfigError::Invalid("report window must be positive".to_string()));
        }
        self.report.tz()?;
        Ok(())
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.report.output_dir)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
}

/// Serde support for compact durations such as `"1d"` or `"2h30m"`.
mod duration_serde {
    use super::{format_duration, parse_duration};
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde support for `HH:MM[:SS]` anchor times.
mod anchor_serde {
    use super::parse_anchor;
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_anchor(&s).map_err(serde::de::Error::custom)
    }
}
