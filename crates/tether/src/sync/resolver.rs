use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use tether_api::{
    ConflictType, RemoteRecord, Resolution, SyncConflict, SyncOperation, SyncQueueEntry,
};

use super::policy::{ConflictStrategy, MergeFunction};

/// Caller-supplied answer to a conflict parked for a user decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    KeepLocal,
    KeepRemote,
    /// Replace both sides with this payload
    Merge(Value),
}

/// What the resolver decided for one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    LocalWins,
    RemoteWins,
    Merged(Value),
    NeedsDecision,
}

impl Verdict {
    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            Verdict::LocalWins => Some(Resolution::LocalWins),
            Verdict::RemoteWins => Some(Resolution::RemoteWins),
            Verdict::Merged(_) => Some(Resolution::Merged),
            Verdict::NeedsDecision => None,
        }
    }
}

/// Newer side wins. Equal timestamps cannot be ordered and need a decision.
pub fn last_write_wins(local_at: DateTime<Utc>, remote_at: DateTime<Utc>) -> Verdict {
    match local_at.cmp(&remote_at) {
        std::cmp::Ordering::Greater => Verdict::LocalWins,
        std::cmp::Ordering::Less => Verdict::RemoteWins,
        std::cmp::Ordering::Equal => Verdict::NeedsDecision,
    }
}

/// Picks a resolution for version conflicts, per table.
///
/// Order of evaluation: the table's fixed strategy if one is configured,
/// then its merge function if one is registered, then last-write-wins.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    strategies: HashMap<String, ConflictStrategy>,
    merges: HashMap<String, Arc<dyn MergeFunction>>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut merge_tables: Vec<&String> = self.merges.keys().collect();
        merge_tables.sort();
        f.debug_struct("ConflictResolver")
            .field("strategies", &self.strategies)
            .field("merge_tables", &merge_tables)
            .finish()
    }
}

#[derive(Default)]
pub struct ResolverBuilder {
    strategies: HashMap<String, ConflictStrategy>,
    merges: HashMap<String, Arc<dyn MergeFunction>>,
}

impl ResolverBuilder {
    pub fn strategy(mut self, table: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.strategies.insert(table.into(), strategy);
        self
    }

    pub fn merge_function(
        mut self,
        table: impl Into<String>,
        merge: impl MergeFunction + 'static,
    ) -> Self {
        self.merges.insert(table.into(), Arc::new(merge));
        self
    }

    pub fn build(self) -> ConflictResolver {
        ConflictResolver {
            strategies: self.strategies,
            merges: self.merges,
        }
    }
}

impl ConflictResolver {
    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::default()
    }

    /// Decide a conflict between a queued entry and the remote version.
    ///
    /// The returned conflict record is already marked resolved unless the
    /// verdict is `NeedsDecision`.
    pub fn resolve(
        &self,
        entry: &SyncQueueEntry,
        remote: &RemoteRecord,
        conflict_type: ConflictType,
        base: Option<&Value>,
    ) -> (SyncConflict, Verdict) {
        let verdict = self.verdict(entry, remote, base);
        let mut conflict = SyncConflict::new(entry, remote.data.clone(), conflict_type);
        if let Some(resolution) = verdict.resolution() {
            conflict.mark_resolved(resolution);
        }
        debug!(
            "Conflict {} on {} ({}): {:?}",
            conflict.id,
            entry.key(),
            conflict_type,
            verdict
        );
        (conflict, verdict)
    }

    fn verdict(
        &self,
        entry: &SyncQueueEntry,
        remote: &RemoteRecord,
        base: Option<&Value>,
    ) -> Verdict {
        let lww = || last_write_wins(entry.created_at, remote.modified_at);

        if let Some(strategy) = self.strategies.get(&entry.table_name) {
            return match strategy {
                ConflictStrategy::LastWriteWins => lww(),
                ConflictStrategy::LocalWins => Verdict::LocalWins,
                ConflictStrategy::RemoteWins => Verdict::RemoteWins,
                ConflictStrategy::Manual => Verdict::NeedsDecision,
            };
        }

        if let Some(merge) = self.merges.get(&entry.table_name) {
            if entry.operation != SyncOperation::Delete {
                if let Some(remote_data) = &remote.data {
                    if let Some(merged) = merge.merge(base, &entry.data, remote_data) {
                        return Verdict::Merged(merged);
                    }
                    debug!("Edits overlap on {}, falling back to last-write-wins", entry.key());
                }
            }
        }

        lww()
    }
}
