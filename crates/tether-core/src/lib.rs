//! Core traits for the tether sync core
//!
//! This crate defines the seams between the engine and its collaborators:
//! - `LocalStore`: record get/upsert/delete keyed by `(table, id)`
//! - `SyncQueueStore`: durable log of pending local mutations
//! - `ConflictLog`: persisted conflict records
//! - `SyncStore`: the three above plus the atomic compound writes
//! - `MarkerStore`: persisted flags (migration completion markers)
//! - `RemoteStore`: push side of the authoritative backend
//! - `LegacySource`: paged reads from the store being migrated away from
//! - `ProgressReporter`: migration event sink

pub mod reporter;
pub mod source;
pub mod traits;

pub use reporter::{NoopReporter, ProgressReporter};
pub use source::{LegacySource, RemoteStore};
pub use traits::{
    ConflictLog, EntryDisposition, LocalChange, LocalStore, MarkerStore, QueueStats,
    ResolutionWrite, SyncQueueStore, SyncStore,
};

pub use tether_api::{StorageError, StorageResult as Result};
