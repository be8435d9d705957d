use async_trait::async_trait;

use tether_api::{LegacyBatch, PushOutcome, StorageResult as Result, SyncQueueEntry};

/// Paged, restartable reads from the store being migrated away from.
///
/// An empty page means the source is exhausted. Reading the same offset
/// twice must return the same records as long as the source content is
/// stable.
#[async_trait]
pub trait LegacySource: Send + Sync {
    async fn read_batch(&self, offset: usize, limit: usize) -> Result<LegacyBatch>;

    /// Get the source identifier (e.g., "legacy-sqlite", "localstorage")
    fn source_name(&self) -> &str;
}

/// Push side of the authoritative remote store.
///
/// Implementations never fail with an error: transport problems are
/// reported as `PushOutcome::TransientError`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Apply a queued mutation, checking it against the remote version.
    async fn push(&self, entry: &SyncQueueEntry) -> PushOutcome;

    /// Unconditionally write the outcome of a conflict resolution for the
    /// entry's key. `resolved` is the winning payload, `None` deletes the
    /// remote record.
    async fn force_push(
        &self,
        entry: &SyncQueueEntry,
        resolved: Option<&serde_json::Value>,
    ) -> PushOutcome;

    /// Get the remote identifier (e.g., "api", "remote-fake")
    fn remote_id(&self) -> &str;
}
