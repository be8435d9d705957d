pub mod config;
pub mod error;
pub mod migration;
pub mod repository;
pub mod storage;
pub mod sync;
pub mod telemetry;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use config::{MigrationSettings, SyncSettings, TetherConfig};
pub use error::{ConfigError, MigrationError, SyncError};
pub use migration::{
    CallbackReporter, ChannelReporter, MigrationConfig, MigrationEvent, MigrationHandle,
    MigrationManager, MigrationManagerBuilder, MigrationOutcome,
};
pub use repository::OfflineRepository;
pub use storage::{MemoryStore, SqliteStore};
pub use sync::{
    last_write_wins, BackoffPolicy, ConflictResolver, ConflictStrategy, Decision, DrainReport,
    FieldMerge, MergeFunction, ResolverBuilder, SyncCoordinator, SyncEvent, SyncHandle, SyncQueue,
    Verdict,
};

// Re-export the shared types so callers only need one dependency
pub use tether_api::*;
pub use tether_core::{
    ConflictLog, LegacySource, LocalChange, LocalStore, MarkerStore, NoopReporter,
    ProgressReporter, QueueStats, RemoteStore, SyncQueueStore, SyncStore,
};
