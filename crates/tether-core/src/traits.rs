use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_api::{Record, RecordKey, StorageResult as Result, SyncConflict, SyncQueueEntry};

/// Record-level access to the local store.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// Insert or replace. Idempotent, which is what makes retried migration
    /// batches safe.
    async fn upsert(&self, record: Record) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, key: &RecordKey) -> Result<bool>;
}

/// Counts over the queue and conflict log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
    pub synced: usize,
    pub unresolved_conflicts: usize,
}

/// Durable storage for sync queue entries.
#[async_trait]
pub trait SyncQueueStore: Send + Sync {
    async fn append(&self, entry: &SyncQueueEntry) -> Result<()>;

    async fn get_entry(&self, id: &str) -> Result<Option<SyncQueueEntry>>;

    /// Every entry without `synced_at` (pending and failed), ordered by
    /// `created_at` with insertion order breaking ties.
    async fn unsynced_entries(&self) -> Result<Vec<SyncQueueEntry>>;

    /// Set `synced_at`, clear `error`, and record `base` as the last payload
    /// both sides agree on for the entry's key (`None` clears it).
    async fn mark_synced(
        &self,
        id: &str,
        synced_at: DateTime<Utc>,
        base: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Increment `retries` and store `error`. With `give_up` the entry moves
    /// to the terminal `failed` status.
    async fn record_failure(&self, id: &str, error: &str, give_up: bool) -> Result<()>;

    /// Remove an entry whose intent was superseded.
    async fn discard(&self, id: &str) -> Result<()>;

    /// Move one `failed` entry back to `pending`. Returns false when the
    /// entry is missing or was not failed.
    async fn requeue(&self, id: &str) -> Result<bool>;

    /// Move every `failed` entry back to `pending`.
    async fn requeue_failed(&self) -> Result<usize>;

    /// Delete synced entries older than the cutoff.
    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// Last payload acknowledged by the remote store for a key.
    async fn sync_base(&self, key: &RecordKey) -> Result<Option<serde_json::Value>>;

    async fn queue_stats(&self) -> Result<QueueStats>;
}

/// Persisted conflict records.
#[async_trait]
pub trait ConflictLog: Send + Sync {
    /// Insert, or replace an existing conflict with the same id.
    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<()>;

    async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>>;

    async fn unresolved_conflicts(&self) -> Result<Vec<SyncConflict>>;

    async fn conflicts_for(&self, key: &RecordKey) -> Result<Vec<SyncConflict>>;
}

/// A change to the local record state.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    Upsert(Record),
    Delete(RecordKey),
}

impl LocalChange {
    pub fn key(&self) -> &RecordKey {
        match self {
            LocalChange::Upsert(record) => &record.key,
            LocalChange::Delete(key) => key,
        }
    }
}

/// What happens to the queue entry that triggered a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryDisposition {
    /// The local intent reached the remote store
    MarkSynced {
        entry_id: String,
        synced_at: DateTime<Utc>,
    },
    /// The remote version supersedes the local intent
    Discard { entry_id: String },
}

/// Everything written when a conflict resolution is applied. Stores apply
/// it in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionWrite {
    /// The conflict, already carrying `resolution`/`resolved_at`
    pub conflict: SyncConflict,
    pub local_change: LocalChange,
    pub disposition: EntryDisposition,
    /// New sync base for the key (`None` clears it)
    pub base: Option<serde_json::Value>,
}

/// The full persistence surface used by the sync engine.
///
/// The compound operations are atomic: either every part is visible or none
/// is.
#[async_trait]
pub trait SyncStore: LocalStore + SyncQueueStore + ConflictLog {
    /// Apply a local change and append its queue entry together, so a local
    /// write can never exist without its entry.
    async fn commit_local_change(&self, change: LocalChange, entry: &SyncQueueEntry)
        -> Result<()>;

    async fn apply_resolution(&self, write: ResolutionWrite) -> Result<()>;
}

/// Persisted boolean flags.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn is_marked(&self, name: &str) -> Result<bool>;

    async fn set_marker(&self, name: &str) -> Result<()>;

    async fn clear_marker(&self, name: &str) -> Result<()>;
}
