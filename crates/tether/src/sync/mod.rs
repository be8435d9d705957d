//! Sync queue draining and conflict resolution
//!
//! - `queue`: sends pending entries in per-key order, hands version
//!   conflicts to the resolver
//! - `resolver` / `policy`: per-table resolution strategies and merging
//! - `backoff`: retry delays for the run loop
//! - `coordinator`: run loop, control handle and events

mod backoff;
mod coordinator;
mod policy;
mod queue;
mod resolver;

pub use backoff::BackoffPolicy;
pub use coordinator::{SyncCoordinator, SyncEvent, SyncHandle};
pub use policy::{ConflictStrategy, FieldMerge, MergeFunction};
pub use queue::{DrainReport, SyncQueue};
pub use resolver::{last_write_wins, ConflictResolver, Decision, ResolverBuilder, Verdict};
