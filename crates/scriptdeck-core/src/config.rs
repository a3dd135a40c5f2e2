//! Engine configuration.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_WORKDIR: &str = "SCRIPTDECK_WORKDIR";
pub const ENV_TERMINATE_GRACE_MS: &str = "SCRIPTDECK_TERMINATE_GRACE_MS";
pub const ENV_EVENT_BUFFER: &str = "SCRIPTDECK_EVENT_BUFFER";
pub const ENV_HISTORY_LIMIT: &str = "SCRIPTDECK_HISTORY_LIMIT";
pub const ENV_HISTORY_POLICY: &str = "SCRIPTDECK_HISTORY_POLICY";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which runs leave a history entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Only runs whose name resolved to a stored script.
    #[default]
    ResolvedOnly,
    /// Any run that carried a name, stored or not.
    RequestedName,
}

impl FromStr for HistoryPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "resolved_only" => Ok(Self::ResolvedOnly),
            "requested_name" => Ok(Self::RequestedName),
            other => Err(ConfigError::InvalidValue {
                key: ENV_HISTORY_POLICY,
                value: other.to_string(),
            }),
        }
    }
}

/// Settings for the execution coordinator and its sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Working directory for runs with neither an override nor a script
    /// default.
    pub default_working_dir: PathBuf,
    /// Time a process group gets between SIGTERM and SIGKILL.
    pub terminate_grace_ms: u64,
    /// Capacity of each session's event queue.
    pub event_buffer: usize,
    /// Entries kept per script by the bundled history stores.
    pub history_limit: usize,
    pub history_policy: HistoryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            terminate_grace_ms: 1000,
            event_buffer: 256,
            history_limit: 10,
            history_policy: HistoryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns error if the file can't be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `SCRIPTDECK_*` environment overrides.
    ///
    /// # Errors
    /// Returns error if a variable holds an unparsable value.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment in production).
    ///
    /// # Errors
    /// Returns error if a value can't be parsed.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_WORKDIR).filter(|v| !v.is_empty()) {
            self.default_working_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup(ENV_TERMINATE_GRACE_MS) {
            self.terminate_grace_ms = parse_number(ENV_TERMINATE_GRACE_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_EVENT_BUFFER) {
            self.event_buffer = parse_number(ENV_EVENT_BUFFER, &v)?;
        }
        if let Some(v) = lookup(ENV_HISTORY_LIMIT) {
            self.history_limit = parse_number(ENV_HISTORY_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_HISTORY_POLICY) {
            self.history_policy = v.parse()?;
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_EVENT_BUFFER,
                value: "0".to_string(),
            });
        }
        Ok(self)
    }

    #[must_use]
    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}
