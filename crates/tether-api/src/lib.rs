//! Shared data types for the tether sync core
//!
//! Everything in here is plain data: records and their keys, queue entries,
//! conflict records, migration progress snapshots and the storage error
//! taxonomy. Behaviour lives in `tether-core` (traits) and `tether` (engine).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod error;
pub mod migration;
pub mod sync;

pub use error::{StorageError, StorageResult};
pub use migration::{LegacyBatch, LegacyRecord, MigrationProgress, MigrationState};
pub use sync::{
    ConflictType, EntryStatus, PushOutcome, RemoteRecord, Resolution, SyncConflict,
    SyncOperation, SyncQueueEntry,
};

/// Identity of a record across the local store, the sync queue and the
/// conflict log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table_name: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(table_name: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table_name, self.record_id)
    }
}

/// A record as held by the local store.
///
/// `data` is always a JSON object; `modified_at` is the time of the last
/// local write and is what last-write-wins compares against the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub data: serde_json::Value,
    pub modified_at: DateTime<Utc>,
}

impl Record {
    pub fn new(key: RecordKey, data: serde_json::Value) -> Self {
        Self {
            key,
            data,
            modified_at: now_millis(),
        }
    }
}

/// Current time truncated to millisecond precision.
///
/// Every timestamp in the system goes through this so that values survive a
/// round trip through the SQLite store (which keeps Unix milliseconds)
/// unchanged.
pub fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// Convert Unix milliseconds to a UTC timestamp, saturating to the epoch on
/// out-of-range input.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
