//! Durable sync store on a sqlx SQLite pool
//!
//! Compound writes (`commit_local_change`, `apply_resolution`,
//! `mark_synced`) each run in a single transaction. Timestamps are stored as
//! Unix milliseconds and payloads as JSON text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use tether_api::{
    from_millis, ConflictType, EntryStatus, Record, RecordKey, Resolution, StorageError,
    StorageResult as Result, SyncConflict, SyncOperation, SyncQueueEntry,
};
use tether_core::{
    ConflictLog, EntryDisposition, LocalChange, LocalStore, MarkerStore, QueueStats,
    ResolutionWrite, SyncQueueStore, SyncStore,
};

use super::schema::init_schema;
use super::validate_record;

const ENTRY_COLUMNS: &str = "id, table_name, record_id, operation, data, device_id, \
                             created_at, synced_at, error, retries, status";

const CONFLICT_COLUMNS: &str = "id, entry_id, table_name, record_id, local_data, remote_data, \
                                conflict_type, resolution, resolved_at, created_at";

/// Map sqlx errors onto the storage taxonomy.
///
/// Connection-level failures mean the store is unavailable; everything else
/// is scoped to the statement that failed.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Configuration(_) => StorageError::Unavailable(err.to_string()),
        sqlx::Error::RowNotFound => StorageError::Database("row not found".to_string()),
        _ => StorageError::Database(err.to_string()),
    }
}

/// SQLite-backed sync store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file and initialize the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        init_schema(&pool).await?;
        info!("Opened sync store at {}", path.as_ref().display());
        Ok(Self { pool })
    }

    /// In-memory database. A single pooled connection that never expires, so
    /// the database lives as long as the store.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(map_sqlx_error)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_json(raw: &str) -> Result<serde_json::Value> {
    Ok(serde_json::from_str(raw)?)
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let table_name: String = row.try_get("table_name").map_err(map_sqlx_error)?;
    let record_id: String = row.try_get("record_id").map_err(map_sqlx_error)?;
    let data: String = row.try_get("data").map_err(map_sqlx_error)?;
    let modified_at: i64 = row.try_get("modified_at").map_err(map_sqlx_error)?;

    Ok(Record {
        key: RecordKey::new(table_name, record_id),
        data: parse_json(&data)?,
        modified_at: from_millis(modified_at),
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<SyncQueueEntry> {
    let operation: String = row.try_get("operation").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    let data: String = row.try_get("data").map_err(map_sqlx_error)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_error)?;
    let synced_at: Option<i64> = row.try_get("synced_at").map_err(map_sqlx_error)?;
    let retries: i64 = row.try_get("retries").map_err(map_sqlx_error)?;

    Ok(SyncQueueEntry {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        table_name: row.try_get("table_name").map_err(map_sqlx_error)?,
        record_id: row.try_get("record_id").map_err(map_sqlx_error)?,
        operation: SyncOperation::from_str(&operation).ok_or_else(|| {
            StorageError::Serialization(format!("unknown operation '{}'", operation))
        })?,
        data: parse_json(&data)?,
        device_id: row.try_get("device_id").map_err(map_sqlx_error)?,
        created_at: from_millis(created_at),
        synced_at: synced_at.map(from_millis),
        error: row.try_get("error").map_err(map_sqlx_error)?,
        retries: u32::try_from(retries).unwrap_or(u32::MAX),
        status: EntryStatus::from_str(&status).ok_or_else(|| {
            StorageError::Serialization(format!("unknown entry status '{}'", status))
        })?,
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<SyncConflict> {
    let local_data: String = row.try_get("local_data").map_err(map_sqlx_error)?;
    let remote_data: Option<String> = row.try_get("remote_data").map_err(map_sqlx_error)?;
    let conflict_type: String = row.try_get("conflict_type").map_err(map_sqlx_error)?;
    let resolution: Option<String> = row.try_get("resolution").map_err(map_sqlx_error)?;
    let resolved_at: Option<i64> = row.try_get("resolved_at").map_err(map_sqlx_error)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_error)?;

    let resolution = match resolution {
        Some(raw) => Some(Resolution::from_str(&raw).ok_or_else(|| {
            StorageError::Serialization(format!("unknown resolution '{}'", raw))
        })?),
        None => None,
    };

    Ok(SyncConflict {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        entry_id: row.try_get("entry_id").map_err(map_sqlx_error)?,
        table_name: row.try_get("table_name").map_err(map_sqlx_error)?,
        record_id: row.try_get("record_id").map_err(map_sqlx_error)?,
        local_data: parse_json(&local_data)?,
        remote_data: remote_data.as_deref().map(parse_json).transpose()?,
        conflict_type: ConflictType::from_str(&conflict_type).ok_or_else(|| {
            StorageError::Serialization(format!("unknown conflict type '{}'", conflict_type))
        })?,
        resolution,
        resolved_at: resolved_at.map(from_millis),
        created_at: from_millis(created_at),
    })
}

async fn upsert_record(conn: &mut SqliteConnection, record: &Record) -> Result<()> {
    validate_record(record)?;
    let data = serde_json::to_string(&record.data)?;

    sqlx::query(
        "INSERT INTO records (table_name, record_id, data, modified_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(table_name, record_id) DO UPDATE SET
             data = excluded.data,
             modified_at = excluded.modified_at",
    )
    .bind(record.key.table_name.as_str())
    .bind(record.key.record_id.as_str())
    .bind(data)
    .bind(record.modified_at.timestamp_millis())
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn delete_record(conn: &mut SqliteConnection, key: &RecordKey) -> Result<bool> {
    let result = sqlx::query("DELETE FROM records WHERE table_name = ? AND record_id = ?")
        .bind(key.table_name.as_str())
        .bind(key.record_id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(result.rows_affected() > 0)
}

async fn apply_change(conn: &mut SqliteConnection, change: &LocalChange) -> Result<()> {
    match change {
        LocalChange::Upsert(record) => upsert_record(conn, record).await,
        LocalChange::Delete(key) => delete_record(conn, key).await.map(|_| ()),
    }
}

async fn insert_entry(conn: &mut SqliteConnection, entry: &SyncQueueEntry) -> Result<()> {
    let data = serde_json::to_string(&entry.data)?;

    sqlx::query(
        "INSERT INTO sync_queue
             (id, table_name, record_id, operation, data, device_id,
              created_at, synced_at, error, retries, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.id.as_str())
    .bind(entry.table_name.as_str())
    .bind(entry.record_id.as_str())
    .bind(entry.operation.as_str())
    .bind(data)
    .bind(entry.device_id.as_str())
    .bind(entry.created_at.timestamp_millis())
    .bind(entry.synced_at.map(|at| at.timestamp_millis()))
    .bind(entry.error.as_deref())
    .bind(i64::from(entry.retries))
    .bind(entry.status.as_str())
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn entry_key(conn: &mut SqliteConnection, id: &str) -> Result<RecordKey> {
    let row = sqlx::query("SELECT table_name, record_id FROM sync_queue WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| StorageError::not_found("sync_queue", id))?;

    let table_name: String = row.try_get("table_name").map_err(map_sqlx_error)?;
    let record_id: String = row.try_get("record_id").map_err(map_sqlx_error)?;
    Ok(RecordKey::new(table_name, record_id))
}

async fn set_base(
    conn: &mut SqliteConnection,
    key: &RecordKey,
    base: Option<&serde_json::Value>,
) -> Result<()> {
    match base {
        Some(data) => {
            sqlx::query(
                "INSERT INTO sync_base (table_name, record_id, data, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(table_name, record_id) DO UPDATE SET
                     data = excluded.data,
                     updated_at = excluded.updated_at",
            )
            .bind(key.table_name.as_str())
            .bind(key.record_id.as_str())
            .bind(serde_json::to_string(data)?)
            .bind(tether_api::now_millis().timestamp_millis())
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        }
        None => {
            sqlx::query("DELETE FROM sync_base WHERE table_name = ? AND record_id = ?")
                .bind(key.table_name.as_str())
                .bind(key.record_id.as_str())
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
        }
    }
    Ok(())
}

async fn mark_entry_synced(
    conn: &mut SqliteConnection,
    id: &str,
    synced_at: DateTime<Utc>,
    base: Option<&serde_json::Value>,
) -> Result<()> {
    let key = entry_key(conn, id).await?;

    sqlx::query(
        "UPDATE sync_queue
         SET synced_at = ?, error = NULL, status = 'synced'
         WHERE id = ?",
    )
    .bind(synced_at.timestamp_millis())
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    set_base(conn, &key, base).await
}

async fn save_conflict_row(conn: &mut SqliteConnection, conflict: &SyncConflict) -> Result<()> {
    let local_data = serde_json::to_string(&conflict.local_data)?;
    let remote_data = conflict
        .remote_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        "INSERT INTO sync_conflicts
             (id, entry_id, table_name, record_id, local_data, remote_data,
              conflict_type, resolution, resolved_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             local_data = excluded.local_data,
             remote_data = excluded.remote_data,
             resolution = excluded.resolution,
             resolved_at = excluded.resolved_at",
    )
    .bind(conflict.id.as_str())
    .bind(conflict.entry_id.as_str())
    .bind(conflict.table_name.as_str())
    .bind(conflict.record_id.as_str())
    .bind(local_data)
    .bind(remote_data)
    .bind(conflict.conflict_type.as_str())
    .bind(conflict.resolution.map(|r| r.as_str()))
    .bind(conflict.resolved_at.map(|at| at.timestamp_millis()))
    .bind(conflict.created_at.timestamp_millis())
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        let row = sqlx::query(
            "SELECT table_name, record_id, data, modified_at
             FROM records WHERE table_name = ? AND record_id = ?",
        )
        .bind(key.table_name.as_str())
        .bind(key.record_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn upsert(&self, record: Record) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        upsert_record(&mut conn, &record).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        delete_record(&mut conn, key).await
    }
}

#[async_trait]
impl SyncQueueStore for SqliteStore {
    async fn append(&self, entry: &SyncQueueEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        insert_entry(&mut conn, entry).await
    }

    async fn get_entry(&self, id: &str) -> Result<Option<SyncQueueEntry>> {
        let sql = format!("SELECT {} FROM sync_queue WHERE id = ?", ENTRY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn unsynced_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_queue WHERE synced_at IS NULL ORDER BY created_at ASC, seq ASC",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn mark_synced(
        &self,
        id: &str,
        synced_at: DateTime<Utc>,
        base: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        mark_entry_synced(&mut tx, id, synced_at, base.as_ref()).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn record_failure(&self, id: &str, error: &str, give_up: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sync_queue
             SET retries = retries + 1,
                 error = ?,
                 status = CASE WHEN ? THEN 'failed' ELSE status END
             WHERE id = ? AND synced_at IS NULL",
        )
        .bind(error)
        .bind(give_up)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("sync_queue", id));
        }
        Ok(())
    }

    async fn discard(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn requeue(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_queue SET status = 'pending', retries = 0, error = NULL
             WHERE id = ? AND status = 'failed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_failed(&self) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE sync_queue SET status = 'pending', retries = 0, error = NULL
             WHERE status = 'failed'",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() as usize)
    }

    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let result =
            sqlx::query("DELETE FROM sync_queue WHERE synced_at IS NOT NULL AND synced_at < ?")
                .bind(older_than.timestamp_millis())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        debug!("Pruned {} synced queue entries", result.rows_affected());
        Ok(result.rows_affected() as usize)
    }

    async fn sync_base(&self, key: &RecordKey) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT data FROM sync_base WHERE table_name = ? AND record_id = ?")
            .bind(key.table_name.as_str())
            .bind(key.record_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let data: String = row.try_get("data").map_err(map_sqlx_error)?;
                Ok(Some(parse_json(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM sync_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let status: String = row.try_get("status").map_err(map_sqlx_error)?;
            let count: i64 = row.try_get("count").map_err(map_sqlx_error)?;
            match EntryStatus::from_str(&status) {
                Some(EntryStatus::Pending) => stats.pending = count as usize,
                Some(EntryStatus::Failed) => stats.failed = count as usize,
                Some(EntryStatus::Synced) => stats.synced = count as usize,
                None => {}
            }
        }

        let unresolved: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM sync_conflicts WHERE resolution IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?
                .try_get("count")
                .map_err(map_sqlx_error)?;
        stats.unresolved_conflicts = unresolved as usize;
        Ok(stats)
    }
}

#[async_trait]
impl ConflictLog for SqliteStore {
    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        save_conflict_row(&mut conn, conflict).await
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>> {
        let sql = format!("SELECT {} FROM sync_conflicts WHERE id = ?", CONFLICT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(conflict_from_row).transpose()
    }

    async fn unresolved_conflicts(&self) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts WHERE resolution IS NULL ORDER BY created_at ASC",
            CONFLICT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter().map(conflict_from_row).collect()
    }

    async fn conflicts_for(&self, key: &RecordKey) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts
             WHERE table_name = ? AND record_id = ?
             ORDER BY created_at ASC",
            CONFLICT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(key.table_name.as_str())
            .bind(key.record_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter().map(conflict_from_row).collect()
    }
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn commit_local_change(&self, change: LocalChange, entry: &SyncQueueEntry) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        // Entry first: a crash between the two statements rolls both back
        insert_entry(&mut tx, entry).await?;
        apply_change(&mut tx, &change).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn apply_resolution(&self, write: ResolutionWrite) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        apply_change(&mut tx, &write.local_change).await?;
        match &write.disposition {
            EntryDisposition::MarkSynced {
                entry_id,
                synced_at,
            } => {
                mark_entry_synced(&mut tx, entry_id, *synced_at, write.base.as_ref()).await?;
            }
            EntryDisposition::Discard { entry_id } => {
                // Fails with NotFound before anything is committed
                entry_key(&mut tx, entry_id).await?;
                sqlx::query("DELETE FROM sync_queue WHERE id = ?")
                    .bind(entry_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
                set_base(&mut tx, write.local_change.key(), write.base.as_ref()).await?;
            }
        }
        save_conflict_row(&mut tx, &write.conflict).await?;

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(
            "Applied {:?} resolution for {}",
            write.conflict.resolution,
            write.local_change.key()
        );
        Ok(())
    }
}

#[async_trait]
impl MarkerStore for SqliteStore {
    async fn is_marked(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM markers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }

    async fn set_marker(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT INTO markers (name, set_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(tether_api::now_millis().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn clear_marker(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM markers WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, title: &str) -> Record {
        Record::new(RecordKey::new("tasks", id), json!({ "title": title }))
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let original = record("t1", "hello");
        store.upsert(original.clone()).await.unwrap();

        let fetched = store.get(&original.key).await.unwrap().unwrap();
        assert_eq!(fetched, original);

        assert!(store.delete(&original.key).await.unwrap());
        assert!(store.get(&original.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_invalid_record() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let err = store
            .upsert(Record::new(RecordKey::new("tasks", ""), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_unsynced_entries_ordered_by_creation_then_insertion() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let stamp = tether_api::now_millis();

        let mut first = SyncQueueEntry::new("tasks", "b", SyncOperation::Create, json!({}), "A");
        let mut second = SyncQueueEntry::new("tasks", "a", SyncOperation::Create, json!({}), "A");
        let mut earlier = SyncQueueEntry::new("tasks", "c", SyncOperation::Create, json!({}), "A");
        first.created_at = stamp;
        second.created_at = stamp;
        earlier.created_at = stamp - chrono::Duration::seconds(1);

        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();
        store.append(&earlier).await.unwrap();

        let ids: Vec<String> = store
            .unsynced_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![earlier.id, first.id, second.id]);
    }

    #[tokio::test]
    async fn test_entry_lifecycle() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let entry = SyncQueueEntry::new(
            "tasks",
            "t1",
            SyncOperation::Update,
            json!({"title": "x"}),
            "A",
        );
        store.append(&entry).await.unwrap();
        assert_eq!(store.get_entry(&entry.id).await.unwrap().unwrap(), entry);

        store
            .record_failure(&entry.id, "connection reset", true)
            .await
            .unwrap();
        let failed = store.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.retries, 1);
        assert_eq!(failed.error.as_deref(), Some("connection reset"));

        assert_eq!(store.requeue_failed().await.unwrap(), 1);
        let synced_at = tether_api::now_millis();
        store
            .mark_synced(&entry.id, synced_at, Some(json!({"title": "x"})))
            .await
            .unwrap();

        let synced = store.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(synced.synced_at, Some(synced_at));
        assert!(synced.error.is_none());
        assert_eq!(synced.status, EntryStatus::Synced);

        let err = store
            .record_failure(&entry.id, "late failure", false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_commit_local_change_rolls_back_on_failure() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let entry = SyncQueueEntry::new("tasks", "t1", SyncOperation::Create, json!({}), "A");
        let bad = LocalChange::Upsert(Record::new(RecordKey::new("tasks", "t1"), json!([1, 2])));

        assert!(store.commit_local_change(bad, &entry).await.is_err());
        assert!(store.get_entry(&entry.id).await.unwrap().is_none());
        assert_eq!(store.queue_stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_conflict_save_and_resolve() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let entry = SyncQueueEntry::new(
            "tasks",
            "t1",
            SyncOperation::Delete,
            json!({"id": "t1"}),
            "A",
        );
        store.append(&entry).await.unwrap();

        let mut conflict = SyncConflict::new(
            &entry,
            Some(json!({"title": "remote"})),
            ConflictType::DeleteAfterUpdate,
        );
        store.save_conflict(&conflict).await.unwrap();
        assert_eq!(store.unresolved_conflicts().await.unwrap(), vec![conflict.clone()]);
        assert_eq!(store.queue_stats().await.unwrap().unresolved_conflicts, 1);

        conflict.mark_resolved(Resolution::LocalWins);
        store
            .apply_resolution(ResolutionWrite {
                conflict: conflict.clone(),
                local_change: LocalChange::Delete(RecordKey::new("tasks", "t1")),
                disposition: EntryDisposition::MarkSynced {
                    entry_id: entry.id.clone(),
                    synced_at: tether_api::now_millis(),
                },
                base: None,
            })
            .await
            .unwrap();

        assert!(store.unresolved_conflicts().await.unwrap().is_empty());
        let stored = store.get_conflict(&conflict.id).await.unwrap().unwrap();
        assert_eq!(stored, conflict);
        let entry = store.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Synced);
    }

    #[tokio::test]
    async fn test_apply_resolution_unknown_entry_changes_nothing() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let entry = SyncQueueEntry::new(
            "tasks",
            "t1",
            SyncOperation::Update,
            json!({"title": "x"}),
            "A",
        );
        let mut conflict = SyncConflict::new(&entry, None, ConflictType::UpdateAfterDelete);
        conflict.mark_resolved(Resolution::RemoteWins);

        let result = store
            .apply_resolution(ResolutionWrite {
                conflict: conflict.clone(),
                local_change: LocalChange::Upsert(record("t1", "x")),
                disposition: EntryDisposition::Discard {
                    entry_id: entry.id.clone(),
                },
                base: None,
            })
            .await;

        assert!(matches!(result, Err(StorageError::NotFound { .. })));
        assert!(store
            .get(&RecordKey::new("tasks", "t1"))
            .await
            .unwrap()
            .is_none());
        assert!(store.get_conflict(&conflict.id).await.unwrap().is_none());
    }
}
