//! In-memory implementation of the sync store
//!
//! All state sits behind one lock, so every compound write is atomic by
//! construction. Useful for:
//! - Unit and integration tests without a database
//! - Reference semantics for the SQLite backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tether_api::{
    EntryStatus, Record, RecordKey, StorageError, StorageResult as Result, SyncConflict,
    SyncQueueEntry,
};
use tether_core::{
    ConflictLog, EntryDisposition, LocalChange, LocalStore, MarkerStore, QueueStats,
    ResolutionWrite, SyncQueueStore, SyncStore,
};

use super::validate_record;

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<RecordKey, Record>,
    /// Queue entries in insertion order
    queue: Vec<SyncQueueEntry>,
    /// Conflicts in detection order
    conflicts: Vec<SyncConflict>,
    bases: HashMap<RecordKey, serde_json::Value>,
    markers: HashSet<String>,
}

impl MemoryState {
    fn entry_mut(&mut self, id: &str) -> Result<&mut SyncQueueEntry> {
        self.queue
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StorageError::not_found("sync_queue", id))
    }

    fn apply_change(&mut self, change: LocalChange) -> Result<()> {
        match change {
            LocalChange::Upsert(record) => {
                validate_record(&record)?;
                self.records.insert(record.key.clone(), record);
            }
            LocalChange::Delete(key) => {
                self.records.remove(&key);
            }
        }
        Ok(())
    }

    fn mark_synced(
        &mut self,
        id: &str,
        synced_at: DateTime<Utc>,
        base: Option<serde_json::Value>,
    ) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.synced_at = Some(synced_at);
        entry.error = None;
        entry.status = EntryStatus::Synced;
        let key = entry.key();
        self.set_base(key, base);
        Ok(())
    }

    fn set_base(&mut self, key: RecordKey, base: Option<serde_json::Value>) {
        match base {
            Some(data) => {
                self.bases.insert(key, data);
            }
            None => {
                self.bases.remove(&key);
            }
        }
    }

    fn save_conflict(&mut self, conflict: &SyncConflict) {
        match self.conflicts.iter_mut().find(|c| c.id == conflict.id) {
            Some(existing) => *existing = conflict.clone(),
            None => self.conflicts.push(conflict.clone()),
        }
    }
}

/// In-memory sync store.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    /// Simulated outage: every call fails with `StorageError::Unavailable`
    unavailable: Arc<AtomicBool>,
    /// Number of writes applied to the records table
    record_writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Count of upserts and deletes applied to records so far.
    pub fn record_writes(&self) -> usize {
        self.record_writes.load(Ordering::SeqCst)
    }

    /// Snapshot of all records, sorted by key.
    pub fn all_records(&self) -> Result<Vec<Record>> {
        let state = self.read()?;
        let mut records: Vec<Record> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    /// Snapshot of the whole queue in insertion order, synced entries included.
    pub fn all_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        Ok(self.read()?.queue.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.check_available()?;
        self.state
            .read()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.check_available()?;
        self.state
            .write()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.read()?.records.get(key).cloned())
    }

    async fn upsert(&self, record: Record) -> Result<()> {
        validate_record(&record)?;
        self.write()?.records.insert(record.key.clone(), record);
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool> {
        let removed = self.write()?.records.remove(key).is_some();
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        Ok(removed)
    }
}

#[async_trait]
impl SyncQueueStore for MemoryStore {
    async fn append(&self, entry: &SyncQueueEntry) -> Result<()> {
        let mut state = self.write()?;
        if state.queue.iter().any(|e| e.id == entry.id) {
            return Err(StorageError::Database(format!(
                "duplicate queue entry id {}",
                entry.id
            )));
        }
        state.queue.push(entry.clone());
        Ok(())
    }

    async fn get_entry(&self, id: &str) -> Result<Option<SyncQueueEntry>> {
        Ok(self.read()?.queue.iter().find(|e| e.id == id).cloned())
    }

    async fn unsynced_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        let state = self.read()?;
        let mut entries: Vec<SyncQueueEntry> = state
            .queue
            .iter()
            .filter(|e| e.synced_at.is_none())
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn mark_synced(
        &self,
        id: &str,
        synced_at: DateTime<Utc>,
        base: Option<serde_json::Value>,
    ) -> Result<()> {
        self.write()?.mark_synced(id, synced_at, base)
    }

    async fn record_failure(&self, id: &str, error: &str, give_up: bool) -> Result<()> {
        let mut state = self.write()?;
        let entry = state.entry_mut(id)?;
        if entry.synced_at.is_some() {
            return Err(StorageError::not_found("sync_queue", id));
        }
        entry.retries += 1;
        entry.error = Some(error.to_string());
        if give_up {
            entry.status = EntryStatus::Failed;
        }
        Ok(())
    }

    async fn discard(&self, id: &str) -> Result<()> {
        self.write()?.queue.retain(|e| e.id != id);
        Ok(())
    }

    async fn requeue(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        match state.queue.iter_mut().find(|e| e.id == id) {
            Some(entry) if entry.status == EntryStatus::Failed => {
                entry.status = EntryStatus::Pending;
                entry.retries = 0;
                entry.error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_failed(&self) -> Result<usize> {
        let mut state = self.write()?;
        let mut count = 0;
        for entry in state
            .queue
            .iter_mut()
            .filter(|e| e.status == EntryStatus::Failed)
        {
            entry.status = EntryStatus::Pending;
            entry.retries = 0;
            entry.error = None;
            count += 1;
        }
        Ok(count)
    }

    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut state = self.write()?;
        let before = state.queue.len();
        state
            .queue
            .retain(|e| !matches!(e.synced_at, Some(at) if at < older_than));
        Ok(before - state.queue.len())
    }

    async fn sync_base(&self, key: &RecordKey) -> Result<Option<serde_json::Value>> {
        Ok(self.read()?.bases.get(key).cloned())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let state = self.read()?;
        let mut stats = QueueStats::default();
        for entry in &state.queue {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Failed => stats.failed += 1,
                EntryStatus::Synced => stats.synced += 1,
            }
        }
        stats.unresolved_conflicts = state.conflicts.iter().filter(|c| !c.is_resolved()).count();
        Ok(stats)
    }
}

#[async_trait]
impl ConflictLog for MemoryStore {
    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        self.write()?.save_conflict(conflict);
        Ok(())
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>> {
        Ok(self.read()?.conflicts.iter().find(|c| c.id == id).cloned())
    }

    async fn unresolved_conflicts(&self) -> Result<Vec<SyncConflict>> {
        Ok(self
            .read()?
            .conflicts
            .iter()
            .filter(|c| !c.is_resolved())
            .cloned()
            .collect())
    }

    async fn conflicts_for(&self, key: &RecordKey) -> Result<Vec<SyncConflict>> {
        Ok(self
            .read()?
            .conflicts
            .iter()
            .filter(|c| c.table_name == key.table_name && c.record_id == key.record_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn commit_local_change(&self, change: LocalChange, entry: &SyncQueueEntry) -> Result<()> {
        if let LocalChange::Upsert(record) = &change {
            validate_record(record)?;
        }
        let mut state = self.write()?;
        if state.queue.iter().any(|e| e.id == entry.id) {
            return Err(StorageError::Database(format!(
                "duplicate queue entry id {}",
                entry.id
            )));
        }
        // Entry first, then the record; both under the same guard
        state.queue.push(entry.clone());
        state.apply_change(change)?;
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_resolution(&self, write: ResolutionWrite) -> Result<()> {
        if let LocalChange::Upsert(record) = &write.local_change {
            validate_record(record)?;
        }
        let mut state = self.write()?;
        let key = write.local_change.key().clone();

        // Validate the entry before touching anything so a missing entry
        // leaves the state untouched
        let entry_id = match &write.disposition {
            EntryDisposition::MarkSynced { entry_id, .. } => entry_id,
            EntryDisposition::Discard { entry_id } => entry_id,
        };
        state.entry_mut(entry_id)?;

        state.apply_change(write.local_change)?;
        match write.disposition {
            EntryDisposition::MarkSynced {
                entry_id,
                synced_at,
            } => state.mark_synced(&entry_id, synced_at, write.base)?,
            EntryDisposition::Discard { entry_id } => {
                state.queue.retain(|e| e.id != entry_id);
                state.set_base(key, write.base);
            }
        }
        state.save_conflict(&write.conflict);
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MarkerStore for MemoryStore {
    async fn is_marked(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.markers.contains(name))
    }

    async fn set_marker(&self, name: &str) -> Result<()> {
        self.write()?.markers.insert(name.to_string());
        Ok(())
    }

    async fn clear_marker(&self, name: &str) -> Result<()> {
        self.write()?.markers.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_api::{ConflictType, Resolution, SyncOperation};

    fn record(id: &str, title: &str) -> Record {
        Record::new(RecordKey::new("tasks", id), json!({ "title": title }))
    }

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let store = MemoryStore::new();
        let key = RecordKey::new("tasks", "t1");

        store.upsert(record("t1", "a")).await.unwrap();
        store.upsert(record("t1", "b")).await.unwrap();
        let fetched = store.get(&key).await.unwrap().unwrap();
        assert_eq!(fetched.data["title"], "b");

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(store.record_writes(), 4);
    }

    #[tokio::test]
    async fn test_rejects_non_object_payload() {
        let store = MemoryStore::new();
        let bad = Record::new(RecordKey::new("tasks", "t1"), json!("just a string"));
        let err = store.upsert(bad).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
        assert_eq!(store.record_writes(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.upsert(record("t1", "a")).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.queue_stats().await.unwrap_err().is_unavailable());

        store.set_unavailable(false);
        store.upsert(record("t1", "a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_local_change_is_all_or_nothing() {
        let store = MemoryStore::new();
        let entry = SyncQueueEntry::new("tasks", "t1", SyncOperation::Create, json!(1), "A");
        let bad = LocalChange::Upsert(Record::new(RecordKey::new("tasks", "t1"), json!(1)));

        assert!(store.commit_local_change(bad, &entry).await.is_err());
        assert!(store.all_entries().unwrap().is_empty());
        assert!(store.all_records().unwrap().is_empty());

        let good = LocalChange::Upsert(record("t1", "a"));
        let entry = SyncQueueEntry::new(
            "tasks",
            "t1",
            SyncOperation::Create,
            json!({"title": "a"}),
            "A",
        );
        store.commit_local_change(good, &entry).await.unwrap();
        assert_eq!(store.all_entries().unwrap().len(), 1);
        assert_eq!(store.all_records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_requeue_and_prune() {
        let store = MemoryStore::new();
        let entry = SyncQueueEntry::new("tasks", "t1", SyncOperation::Update, json!({}), "A");
        store.append(&entry).await.unwrap();

        store.record_failure(&entry.id, "timeout", false).await.unwrap();
        store.record_failure(&entry.id, "timeout", true).await.unwrap();
        let failed = store.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(failed.retries, 2);
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(store.queue_stats().await.unwrap().failed, 1);

        assert!(store.requeue(&entry.id).await.unwrap());
        assert!(!store.requeue(&entry.id).await.unwrap());
        let requeued = store.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, EntryStatus::Pending);
        assert_eq!(requeued.retries, 0);
        assert!(requeued.error.is_none());

        let synced_at = tether_api::now_millis();
        store
            .mark_synced(&entry.id, synced_at, Some(json!({"title": "x"})))
            .await
            .unwrap();
        assert!(store.unsynced_entries().await.unwrap().is_empty());

        // Synced entries are frozen
        let err = store
            .record_failure(&entry.id, "late failure", false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        let frozen = store.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(frozen.status, EntryStatus::Synced);
        assert_eq!(frozen.retries, 0);
        assert!(frozen.error.is_none());

        assert_eq!(
            store
                .sync_base(&RecordKey::new("tasks", "t1"))
                .await
                .unwrap(),
            Some(json!({"title": "x"}))
        );

        let pruned = store
            .prune_synced(synced_at + chrono::Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.all_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_resolution_discard() {
        let store = MemoryStore::new();
        let entry = SyncQueueEntry::new(
            "tasks",
            "t1",
            SyncOperation::Update,
            json!({"title": "local"}),
            "A",
        );
        store.append(&entry).await.unwrap();

        let mut conflict = SyncConflict::new(
            &entry,
            Some(json!({"title": "remote"})),
            ConflictType::ConcurrentUpdate,
        );
        conflict.mark_resolved(Resolution::RemoteWins);

        store
            .apply_resolution(ResolutionWrite {
                conflict: conflict.clone(),
                local_change: LocalChange::Upsert(record("t1", "remote")),
                disposition: EntryDisposition::Discard {
                    entry_id: entry.id.clone(),
                },
                base: Some(json!({"title": "remote"})),
            })
            .await
            .unwrap();

        assert!(store.get_entry(&entry.id).await.unwrap().is_none());
        let stored = store.get_conflict(&conflict.id).await.unwrap().unwrap();
        assert_eq!(stored.resolution, Some(Resolution::RemoteWins));
        let local = store
            .get(&RecordKey::new("tasks", "t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.data["title"], "remote");
    }

    #[tokio::test]
    async fn test_markers() {
        let store = MemoryStore::new();
        assert!(!store.is_marked("migration.completed.v1").await.unwrap());
        store.set_marker("migration.completed.v1").await.unwrap();
        assert!(store.is_marked("migration.completed.v1").await.unwrap());
        assert!(!store.is_marked("migration.completed.v2").await.unwrap());
        store.clear_marker("migration.completed.v1").await.unwrap();
        assert!(!store.is_marked("migration.completed.v1").await.unwrap());
    }
}
