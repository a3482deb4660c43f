//! Configuration (dealbatch.toml).
//!
//! ```toml
//! [log]
//! level = "debug"
//! format = "json"
//!
//! [queue]
//! name = "deal"
//! debounce_ms = 300
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Upper bound for the debounce window.
pub const MAX_DEBOUNCE_MS: u64 = 60_000;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Mutation queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Name used in log fields
    pub name: String,
    /// Trailing debounce window in milliseconds
    pub debounce_ms: u64,
    /// Buffered dispatch outcomes per waiting `flush` call
    pub settle_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "deal".to_string(),
            debounce_ms: 300,
            settle_capacity: 64,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_ms > MAX_DEBOUNCE_MS {
            return Err(ConfigError::ValidationError(format!(
                "queue.debounce_ms must be <= {MAX_DEBOUNCE_MS}, got {}",
                self.debounce_ms
            )));
        }
        if self.settle_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue.settle_capacity must be >= 1".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "queue.name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DealbatchConfig {
    pub log: LogConfig,
    pub queue: QueueConfig,
}

impl DealbatchConfig {
    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|err| ConfigError::ParseFailed(err.to_string()))?;
        config.queue.validate()?;
        crate::logging::parse_level(&config.log.level)
            .map_err(|err| ConfigError::ValidationError(format!("log.level: {err}")))?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|err| ConfigError::ParseFailed(err.to_string()))
    }
}

/// Load configuration from `path`, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<DealbatchConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(DealbatchConfig::default());
    };
    let display = path.display().to_string();
    if !path.exists() {
        return Err(ConfigError::FileNotFound(display));
    }
    let text = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::ReadFailed(display, err.to_string()))?;
    DealbatchConfig::from_toml_str(&text)
}
