use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ttl::ExpireAfter;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "UNLEASH_METRICS_CONFIG";

const CONFIG_NAMES: [&str; 2] = ["unleash-metrics.yaml", "unleash-metrics.yml"];

/// One rolling window: how long entries live and how often it is swept.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct WindowConfig {
    pub expire_after: ExpireAfter,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl WindowConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_sweep_interval() -> u64 {
    10_000
}

fn default_bulk_interval() -> u64 {
    5_000
}

fn default_announcement_interval() -> u64 {
    5 * 60 * 1000
}

fn default_last_hour() -> WindowConfig {
    WindowConfig {
        expire_after: ExpireAfter::hours(1),
        sweep_interval_ms: default_sweep_interval(),
    }
}

fn default_last_minute() -> WindowConfig {
    WindowConfig {
        expire_after: ExpireAfter::minutes(1),
        sweep_interval_ms: default_sweep_interval(),
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Root configuration file structure
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// How often buffered client registrations are written out
    #[serde(default = "default_bulk_interval")]
    pub bulk_interval_ms: u64,

    /// How often newly seen applications are announced
    #[serde(default = "default_announcement_interval")]
    pub announcement_interval_ms: u64,

    #[serde(default = "default_last_hour")]
    pub last_hour: WindowConfig,

    #[serde(default = "default_last_minute")]
    pub last_minute: WindowConfig,

    /// Default tracing filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bulk_interval_ms: default_bulk_interval(),
            announcement_interval_ms: default_announcement_interval(),
            last_hour: default_last_hour(),
            last_minute: default_last_minute(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("no config file found, searched: {searched:?}")]
    NotFound { searched: Vec<PathBuf> },
}

impl MetricsConfig {
    pub fn bulk_interval(&self) -> Duration {
        Duration::from_millis(self.bulk_interval_ms)
    }

    pub fn announcement_interval(&self) -> Duration {
        Duration::from_millis(self.announcement_interval_ms)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        // An empty document means "all defaults"
        let config: MetricsConfig = if content.trim().is_empty() {
            MetricsConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Search for a config file: `$UNLEASH_METRICS_CONFIG` first, then
    /// `start_dir` and each of its parents.
    pub fn discover(start_dir: &Path) -> Result<(PathBuf, Self), ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::discover_from(env_path, start_dir)
    }

    /// [`discover`](Self::discover) with the env override passed in.
    pub fn discover_from(
        env_path: Option<PathBuf>,
        start_dir: &Path,
    ) -> Result<(PathBuf, Self), ConfigError> {
        let mut searched = Vec::new();

        if let Some(path) = env_path {
            if path.exists() {
                let config = Self::load(&path)?;
                return Ok((path, config));
            }
            searched.push(path);
        }

        let mut dir = Some(start_dir);
        while let Some(current) = dir {
            for name in CONFIG_NAMES {
                let path = current.join(name);
                if path.exists() {
                    let config = Self::load(&path)?;
                    return Ok((path, config));
                }
                searched.push(path);
            }
            dir = current.parent();
        }

        Err(ConfigError::NotFound { searched })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("bulk_interval_ms", self.bulk_interval_ms)?;
        positive("announcement_interval_ms", self.announcement_interval_ms)?;
        validate_window("last_hour", &self.last_hour)?;
        validate_window("last_minute", &self.last_minute)?;

        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "log_level",
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

fn validate_window(field: &'static str, window: &WindowConfig) -> Result<(), ConfigError> {
    if window.expire_after.amount == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "expire_after.amount must be greater than zero".into(),
        });
    }
    if window.sweep_interval_ms == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "sweep_interval_ms must be greater than zero".into(),
        });
    }
    Ok(())
}
