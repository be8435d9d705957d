use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use tether_api::{Record, RecordKey, StorageError, SyncOperation, SyncQueueEntry};
use tether_core::{LocalChange, SyncStore};

use crate::error::Result;
use crate::sync::SyncHandle;

/// Application-facing write path.
///
/// Every write changes the local record and appends its queue entry in one
/// store transaction, then nudges the sync loop if one is attached.
#[derive(Clone)]
pub struct OfflineRepository {
    store: Arc<dyn SyncStore>,
    device_id: String,
    sync: Option<SyncHandle>,
}

impl OfflineRepository {
    pub fn new(store: Arc<dyn SyncStore>, device_id: impl Into<String>) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            sync: None,
        }
    }

    pub fn with_sync_handle(mut self, handle: SyncHandle) -> Self {
        self.sync = Some(handle);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn get(&self, table_name: &str, record_id: &str) -> Result<Option<Record>> {
        Ok(self.store.get(&RecordKey::new(table_name, record_id)).await?)
    }

    /// Returns the id of the queued entry.
    pub async fn create(&self, table_name: &str, record_id: &str, data: Value) -> Result<String> {
        self.write(table_name, record_id, SyncOperation::Create, data)
            .await
    }

    /// Fails with `NotFound` if the record does not exist locally.
    pub async fn update(&self, table_name: &str, record_id: &str, data: Value) -> Result<String> {
        self.require_existing(table_name, record_id).await?;
        self.write(table_name, record_id, SyncOperation::Update, data)
            .await
    }

    pub async fn delete(&self, table_name: &str, record_id: &str) -> Result<String> {
        self.require_existing(table_name, record_id).await?;
        let key_data = json!({ "table_name": table_name, "record_id": record_id });
        self.write(table_name, record_id, SyncOperation::Delete, key_data)
            .await
    }

    async fn require_existing(&self, table_name: &str, record_id: &str) -> Result<()> {
        match self.get(table_name, record_id).await? {
            Some(_) => Ok(()),
            None => Err(StorageError::not_found(table_name, record_id).into()),
        }
    }

    async fn write(
        &self,
        table_name: &str,
        record_id: &str,
        operation: SyncOperation,
        data: Value,
    ) -> Result<String> {
        let key = RecordKey::new(table_name, record_id);
        let change = match operation {
            SyncOperation::Delete => LocalChange::Delete(key),
            SyncOperation::Create | SyncOperation::Update => {
                LocalChange::Upsert(Record::new(key, data.clone()))
            }
        };
        let entry = SyncQueueEntry::new(table_name, record_id, operation, data, &self.device_id);

        self.store.commit_local_change(change, &entry).await?;
        debug!("Committed {} {} as entry {}", operation, entry.key(), entry.id);

        if let Some(sync) = &self.sync {
            sync.wake();
        }
        Ok(entry.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::storage::MemoryStore;
    use tether_core::SyncQueueStore;

    #[tokio::test]
    async fn test_writes_enqueue_with_device_id() {
        let store = MemoryStore::new();
        let repo = OfflineRepository::new(Arc::new(store.clone()), "device-A");

        repo.create("tasks", "t1", json!({"title": "a"})).await.unwrap();
        repo.update("tasks", "t1", json!({"title": "b"})).await.unwrap();
        repo.delete("tasks", "t1").await.unwrap();

        let entries = store.unsynced_entries().await.unwrap();
        let ops: Vec<SyncOperation> = entries.iter().map(|e| e.operation).collect();
        assert_eq!(
            ops,
            vec![SyncOperation::Create, SyncOperation::Update, SyncOperation::Delete]
        );
        assert!(entries.iter().all(|e| e.device_id == "device-A"));
        assert_eq!(
            entries[2].data,
            json!({"table_name": "tasks", "record_id": "t1"})
        );
        assert!(repo.get("tasks", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_of_missing_record_enqueues_nothing() {
        let store = MemoryStore::new();
        let repo = OfflineRepository::new(Arc::new(store.clone()), "device-A");

        let err = repo
            .update("tasks", "ghost", json!({"title": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Storage(StorageError::NotFound { .. })
        ));
        assert!(store.unsynced_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_payload_leaves_no_entry() {
        let store = MemoryStore::new();
        let repo = OfflineRepository::new(Arc::new(store.clone()), "device-A");

        assert!(repo.create("tasks", "t1", json!([1, 2, 3])).await.is_err());
        assert!(store.unsynced_entries().await.unwrap().is_empty());
        assert!(repo.get("tasks", "t1").await.unwrap().is_none());
    }
}
