//! Configuration loading for the sync core.
//!
//! Configuration is loaded from a TOML file (default: `mdsync.toml`).
//! Every field has a default, so an empty file is a valid configuration.

use mdsync_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for one logged-in device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// This device.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Task manager configuration.
    #[serde(default)]
    pub tasks: TaskConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Device identification shown to the other devices in the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Label used when registering with the device group.
    #[serde(default = "default_device_label")]
    pub label: String,
    /// Platform hint, e.g. "desktop" or "android".
    #[serde(default)]
    pub platform: Option<String>,
}

/// Task manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Bounded queue capacity (default: 64).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Retries for idempotent tasks after a transient failure (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds (default: 500).
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Retry delay cap in milliseconds (default: 30000).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file holding nonces and pending tasks.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

// Default value functions
fn default_device_label() -> String {
    "mdsync device".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_database_path() -> PathBuf {
    PathBuf::from("mdsync.db")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            label: default_device_label(),
            platform: None,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl TaskConfig {
    /// Retry policy for idempotent tasks.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_values() {
        let config = ClientConfig::default();
        assert_eq!(config.tasks.queue_capacity, 64);
        assert_eq!(config.tasks.max_retries, 3);
        assert_eq!(config.storage.database, PathBuf::from("mdsync.db"));
        assert!(config.device.platform.is_none());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[device]
label = "Laptop"
platform = "desktop"

[tasks]
max_retries = 5
backoff_initial_ms = 100
"#;

        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.device.label, "Laptop");
        assert_eq!(config.device.platform.as_deref(), Some("desktop"));
        assert_eq!(config.tasks.max_retries, 5);
        assert_eq!(config.tasks.queue_capacity, 64);
        assert_eq!(config.tasks.backoff_max_ms, 30_000);
    }

    #[test]
    fn retry_policy_from_config() {
        let tasks = TaskConfig {
            max_retries: 2,
            backoff_initial_ms: 10,
            backoff_max_ms: 40,
            ..TaskConfig::default()
        };

        let policy = tasks.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
        assert_eq!(policy.max_backoff, Duration::from_millis(40));
    }

    #[test]
    fn from_file_round_trips_rendered_config() {
        let mut config = ClientConfig::default();
        config.device.label = "Phone".into();
        config.storage.database = PathBuf::from("/var/lib/mdsync/phone.db");

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        assert_eq!(ClientConfig::from_file(file.path()).unwrap(), config);
    }

    #[test]
    fn from_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_reports_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[tasks]\nmax_retries = \"many\"\n").unwrap();

        let err = ClientConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
