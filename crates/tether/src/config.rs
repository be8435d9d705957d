use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration, usually loaded from a YAML file.
///
/// Every field has a default, so an empty document is a valid config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Stamped on every queue entry written by this client
    pub device_id: String,
    pub database_path: PathBuf,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_filter: String,
    pub migration: MigrationSettings,
    pub sync: SyncSettings,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            device_id: "local".to_string(),
            database_path: PathBuf::from("tether.db"),
            log_filter: "info".to_string(),
            migration: MigrationSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub delay_between_batches_ms: u64,
    pub version: String,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delay_between_batches_ms: 0,
            version: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Failed sends before an entry is parked as `failed`
    pub max_retries: u32,
    /// Entries sent per drain cycle
    pub drain_limit: usize,
    pub push_timeout_ms: u64,
    /// Wait between cycles when nothing is failing
    pub poll_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            max_retries: 8,
            drain_limit: 50,
            push_timeout_ms: 10_000,
            poll_interval_ms: 5_000,
        }
    }
}

impl SyncSettings {
    /// Zero limits, timeouts or poll intervals would stall or spin the
    /// coordinator, so they are rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(invalid("sync.max_retries", "must be greater than zero"));
        }
        if self.drain_limit == 0 {
            return Err(invalid("sync.drain_limit", "must be greater than zero"));
        }
        if self.push_timeout_ms == 0 {
            return Err(invalid("sync.push_timeout_ms", "must be greater than zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("sync.poll_interval_ms", "must be greater than zero"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(invalid(
                "sync.backoff_base_ms",
                format!(
                    "{} exceeds backoff_max_ms {}",
                    self.backoff_base_ms, self.backoff_max_ms
                ),
            ));
        }
        Ok(())
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TetherConfig {
    /// Load and validate a YAML config file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        // serde_yaml rejects a fully empty document, which should mean "all defaults"
        let config: TetherConfig = if content.trim().is_empty() {
            TetherConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(invalid("device_id", "must not be empty"));
        }
        if self.migration.batch_size == 0 {
            return Err(invalid("migration.batch_size", "must be greater than zero"));
        }
        self.sync.validate()
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = TetherConfig::from_yaml_str(
            r#"
device_id: laptop-7
sync:
  max_retries: 3
"#,
        )
        .unwrap();

        assert_eq!(config.device_id, "laptop-7");
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.backoff_base_ms, 500);
        assert_eq!(config.migration, MigrationSettings::default());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(
            TetherConfig::from_yaml_str("").unwrap(),
            TetherConfig::default()
        );
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let err = TetherConfig::from_yaml_str("migration:\n  batch_size: 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "migration.batch_size",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let err = TetherConfig::from_yaml_str(
            "sync:\n  backoff_base_ms: 5000\n  backoff_max_ms: 100\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "sync.backoff_base_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_zero_sync_intervals() {
        for (yaml, field) in [
            ("sync:\n  poll_interval_ms: 0\n", "sync.poll_interval_ms"),
            ("sync:\n  push_timeout_ms: 0\n", "sync.push_timeout_ms"),
            ("sync:\n  drain_limit: 0\n", "sync.drain_limit"),
        ] {
            match TetherConfig::from_yaml_str(yaml).unwrap_err() {
                ConfigError::Invalid { field: reported, .. } => assert_eq!(reported, field),
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let err = TetherConfig::from_yaml_str("sync: [not, a, map]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        match TetherConfig::load_from_file(&path).unwrap_err() {
            ConfigError::Io { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
