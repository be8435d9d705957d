//! Storage backends
//!
//! - `memory`: lock-protected in-memory store, used by tests and as the
//!   reference implementation
//! - `sqlite`: durable store on a sqlx SQLite pool
//!
//! Both implement every persistence trait from `tether-core`.

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use tether_api::{Record, StorageError, StorageResult};

/// Records must carry a JSON object payload and a non-empty key.
pub(crate) fn validate_record(record: &Record) -> StorageResult<()> {
    if record.key.table_name.is_empty() || record.key.record_id.is_empty() {
        return Err(StorageError::InvalidRecord(format!(
            "empty key component in '{}'",
            record.key
        )));
    }
    if !record.data.is_object() {
        return Err(StorageError::InvalidRecord(format!(
            "payload for '{}' is not a JSON object",
            record.key
        )));
    }
    Ok(())
}
