//! SQLite schema for the durable store

use sqlx::SqlitePool;
use tracing::{debug, info};

use tether_api::StorageResult as Result;

use super::sqlite::map_sqlx_error;

const SCHEMA: &[&str] = &[
    // Current local record state
    "CREATE TABLE IF NOT EXISTS records (
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        data TEXT NOT NULL,
        modified_at INTEGER NOT NULL,
        PRIMARY KEY (table_name, record_id)
    )",
    // Append-mostly log of local mutations; seq breaks created_at ties
    "CREATE TABLE IF NOT EXISTS sync_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        data TEXT NOT NULL,
        device_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        synced_at INTEGER,
        error TEXT,
        retries INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending'
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_unsynced
     ON sync_queue(created_at, seq)
     WHERE synced_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_sync_queue_key
     ON sync_queue(table_name, record_id, created_at)",
    "CREATE TABLE IF NOT EXISTS sync_conflicts (
        id TEXT PRIMARY KEY,
        entry_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        local_data TEXT NOT NULL,
        remote_data TEXT,
        conflict_type TEXT NOT NULL,
        resolution TEXT,
        resolved_at INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_unresolved
     ON sync_conflicts(table_name, record_id)
     WHERE resolution IS NULL",
    // Last payload acknowledged by the remote store, per key
    "CREATE TABLE IF NOT EXISTS sync_base (
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (table_name, record_id)
    )",
    "CREATE TABLE IF NOT EXISTS markers (
        name TEXT PRIMARY KEY,
        set_at INTEGER NOT NULL
    )",
];

/// Create every table and index if missing. Safe to call on every open.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        debug!("Applying schema statement: {}", statement);
        sqlx::query(*statement)
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;
    }
    info!("Sync store schema initialized");
    Ok(())
}
