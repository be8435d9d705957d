use std::path::PathBuf;

use tether_api::{MigrationState, StorageError};
use thiserror::Error;

/// Failures that end a migration run in the `Failed` state.
///
/// Per-record problems never show up here; they are collected in
/// `MigrationProgress::errors` and the run carries on.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Invalid migration configuration: {0}")]
    InvalidConfig(String),

    #[error("Legacy source '{source_name}' failed at offset {offset}: {error}")]
    Source {
        source_name: String,
        offset: usize,
        #[source]
        error: StorageError,
    },

    #[error("Local store failed: {0}")]
    Store(#[from] StorageError),

    #[error("Migration already started (state: {0})")]
    AlreadyStarted(MigrationState),
}

/// Failures surfaced by the sync queue and coordinator.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(String),

    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("Invalid decision for conflict {conflict_id}: {message}")]
    InvalidDecision {
        conflict_id: String,
        message: String,
    },

    #[error("Remote write failed while applying resolution: {0}")]
    ResolutionPush(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Whether the error means the store itself is gone, which ends a sync
    /// run instead of a single entry attempt.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, SyncError::Storage(e) if e.is_unavailable())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;
