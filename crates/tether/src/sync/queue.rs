use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tether_api::{
    now_millis, ConflictType, EntryStatus, PushOutcome, Record, RecordKey, RemoteRecord,
    Resolution, SyncConflict, SyncOperation, SyncQueueEntry,
};
use tether_core::{
    EntryDisposition, LocalChange, QueueStats, RemoteStore, ResolutionWrite, SyncStore,
};

use super::resolver::{ConflictResolver, Decision, Verdict};
use crate::config::SyncSettings;
use crate::error::{Result, SyncError};

/// Counters for one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries handed to the remote store
    pub sent: usize,
    pub synced: usize,
    pub conflicts: usize,
    /// Conflicts resolved automatically in this pass
    pub resolved: usize,
    /// Conflicts parked for a user decision
    pub pending_decisions: usize,
    pub transient_failures: usize,
    /// Entries that hit the retry cap in this pass
    pub exhausted: usize,
    /// Lowest retry count among entries that failed transiently
    pub lowest_failed_retries: Option<u32>,
}

impl DrainReport {
    pub fn is_idle(&self) -> bool {
        self.sent == 0
    }
}

/// How a single entry ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryResult {
    Synced,
    Resolved,
    AwaitingDecision,
    Retrying { retries: u32 },
    Exhausted,
}

/// Durable queue of local mutations and the logic that sends them.
pub struct SyncQueue {
    store: Arc<dyn SyncStore>,
    remote: Arc<dyn RemoteStore>,
    resolver: ConflictResolver,
    max_retries: u32,
    push_timeout: Duration,
}

impl SyncQueue {
    pub fn new(
        store: Arc<dyn SyncStore>,
        remote: Arc<dyn RemoteStore>,
        resolver: ConflictResolver,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            store,
            remote,
            resolver,
            max_retries: settings.max_retries,
            push_timeout: settings.push_timeout(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// Append an entry without touching the local record state. Local
    /// writes should go through `OfflineRepository`, which commits both
    /// together.
    pub async fn enqueue(
        &self,
        table_name: &str,
        record_id: &str,
        operation: SyncOperation,
        data: Value,
        device_id: &str,
    ) -> Result<String> {
        let entry = SyncQueueEntry::new(table_name, record_id, operation, data, device_id);
        self.store.append(&entry).await?;
        debug!("Enqueued {} {} ({})", entry.operation, entry.key(), entry.id);
        Ok(entry.id)
    }

    /// Send up to `limit` pending entries, oldest first.
    ///
    /// A key is skipped for the rest of the pass once it has an unresolved
    /// conflict, a parked `failed` entry, or an entry that did not make it
    /// in this pass, so later entries never overtake earlier ones.
    pub async fn drain(&self, limit: usize) -> Result<DrainReport> {
        let entries = self.store.unsynced_entries().await?;
        let mut blocked: HashSet<RecordKey> = self
            .store
            .unresolved_conflicts()
            .await?
            .iter()
            .map(SyncConflict::key)
            .collect();

        let mut report = DrainReport::default();
        for entry in entries {
            if report.sent >= limit {
                break;
            }
            let key = entry.key();
            if blocked.contains(&key) {
                continue;
            }
            if entry.status == EntryStatus::Failed {
                blocked.insert(key);
                continue;
            }

            report.sent += 1;
            match self.send(&entry).await? {
                EntryResult::Synced => report.synced += 1,
                EntryResult::Resolved => {
                    report.conflicts += 1;
                    report.resolved += 1;
                }
                EntryResult::AwaitingDecision => {
                    report.conflicts += 1;
                    report.pending_decisions += 1;
                    blocked.insert(key);
                }
                EntryResult::Retrying { retries } => {
                    report.transient_failures += 1;
                    report.lowest_failed_retries = Some(
                        report
                            .lowest_failed_retries
                            .map_or(retries, |lowest| lowest.min(retries)),
                    );
                    blocked.insert(key);
                }
                EntryResult::Exhausted => {
                    report.exhausted += 1;
                    blocked.insert(key);
                }
            }
        }

        if !report.is_idle() {
            info!(
                "Drained {} entries: {} synced, {} conflicts, {} failed",
                report.sent,
                report.synced,
                report.conflicts,
                report.transient_failures + report.exhausted
            );
        }
        Ok(report)
    }

    async fn send(&self, entry: &SyncQueueEntry) -> Result<EntryResult> {
        let outcome = match timeout(self.push_timeout, self.remote.push(entry)).await {
            Ok(outcome) => outcome,
            Err(_) => PushOutcome::TransientError(format!(
                "push timed out after {}ms",
                self.push_timeout.as_millis()
            )),
        };

        match outcome {
            PushOutcome::Accepted => {
                self.store
                    .mark_synced(&entry.id, now_millis(), acknowledged_base(entry))
                    .await?;
                debug!("Synced {} {}", entry.operation, entry.key());
                Ok(EntryResult::Synced)
            }
            PushOutcome::TransientError(message) => self.fail(entry, &message).await,
            PushOutcome::VersionConflict(remote) => self.handle_conflict(entry, remote).await,
        }
    }

    async fn handle_conflict(
        &self,
        entry: &SyncQueueEntry,
        remote: RemoteRecord,
    ) -> Result<EntryResult> {
        let Some(conflict_type) = ConflictType::classify(entry.operation, &remote) else {
            // Both sides deleted the record
            self.store.mark_synced(&entry.id, now_millis(), None).await?;
            return Ok(EntryResult::Synced);
        };

        let base = self.store.sync_base(&entry.key()).await?;
        let (conflict, verdict) =
            self.resolver.resolve(entry, &remote, conflict_type, base.as_ref());

        match verdict {
            Verdict::NeedsDecision => {
                self.store.save_conflict(&conflict).await?;
                warn!(
                    "Conflict {} on {} needs a decision; key blocked",
                    conflict.id,
                    entry.key()
                );
                Ok(EntryResult::AwaitingDecision)
            }
            Verdict::RemoteWins => {
                self.store
                    .apply_resolution(remote_wins_write(conflict, entry, remote.data))
                    .await?;
                Ok(EntryResult::Resolved)
            }
            Verdict::LocalWins => {
                let winning = local_payload(entry);
                match self.force_push(entry, winning.as_ref()).await {
                    Ok(()) => {
                        self.store
                            .apply_resolution(local_wins_write(conflict, entry, winning))
                            .await?;
                        Ok(EntryResult::Resolved)
                    }
                    Err(message) => self.fail(entry, &message).await,
                }
            }
            Verdict::Merged(merged) => match self.force_push(entry, Some(&merged)).await {
                Ok(()) => {
                    self.store
                        .apply_resolution(local_wins_write(conflict, entry, Some(merged)))
                        .await?;
                    Ok(EntryResult::Resolved)
                }
                Err(message) => self.fail(entry, &message).await,
            },
        }
    }

    async fn force_push(
        &self,
        entry: &SyncQueueEntry,
        resolved: Option<&Value>,
    ) -> std::result::Result<(), String> {
        match timeout(self.push_timeout, self.remote.force_push(entry, resolved)).await {
            Ok(PushOutcome::Accepted) => Ok(()),
            Ok(PushOutcome::TransientError(message)) => Err(message),
            Ok(PushOutcome::VersionConflict(_)) => {
                Err("remote changed again while writing resolution".to_string())
            }
            Err(_) => Err(format!(
                "resolution push timed out after {}ms",
                self.push_timeout.as_millis()
            )),
        }
    }

    async fn fail(&self, entry: &SyncQueueEntry, message: &str) -> Result<EntryResult> {
        let retries = entry.retries.saturating_add(1);
        let give_up = retries >= self.max_retries;
        self.store.record_failure(&entry.id, message, give_up).await?;

        if give_up {
            warn!(
                "Giving up on {} {} after {} attempts: {}",
                entry.operation,
                entry.key(),
                retries,
                message
            );
            Ok(EntryResult::Exhausted)
        } else {
            debug!(
                "Send of {} failed (attempt {}): {}",
                entry.key(),
                retries,
                message
            );
            Ok(EntryResult::Retrying { retries })
        }
    }

    /// Apply a caller's decision to a conflict that was parked for one.
    pub async fn apply_decision(&self, conflict_id: &str, decision: Decision) -> Result<()> {
        let mut conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        if conflict.is_resolved() {
            return Err(SyncError::AlreadyResolved(conflict_id.to_string()));
        }
        let entry = self
            .store
            .get_entry(&conflict.entry_id)
            .await?
            .ok_or_else(|| SyncError::EntryNotFound(conflict.entry_id.clone()))?;

        conflict.mark_resolved(Resolution::UserDecision);
        let write = match decision {
            Decision::KeepRemote => {
                let remote_data = conflict.remote_data.clone();
                remote_wins_write(conflict, &entry, remote_data)
            }
            Decision::KeepLocal => {
                let winning = local_payload(&entry);
                self.force_push(&entry, winning.as_ref())
                    .await
                    .map_err(SyncError::ResolutionPush)?;
                local_wins_write(conflict, &entry, winning)
            }
            Decision::Merge(merged) => {
                if !merged.is_object() {
                    return Err(SyncError::InvalidDecision {
                        conflict_id: conflict_id.to_string(),
                        message: "merged payload must be a JSON object".to_string(),
                    });
                }
                self.force_push(&entry, Some(&merged))
                    .await
                    .map_err(SyncError::ResolutionPush)?;
                local_wins_write(conflict, &entry, Some(merged))
            }
        };

        self.store.apply_resolution(write).await?;
        info!("Applied user decision to conflict {}", conflict_id);
        Ok(())
    }

    pub async fn requeue(&self, entry_id: &str) -> Result<bool> {
        let requeued = self.store.requeue(entry_id).await?;
        if requeued {
            info!("Requeued entry {}", entry_id);
        }
        Ok(requeued)
    }

    pub async fn requeue_failed(&self) -> Result<usize> {
        let count = self.store.requeue_failed().await?;
        if count > 0 {
            info!("Requeued {} failed entries", count);
        }
        Ok(count)
    }

    pub async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<usize> {
        Ok(self.store.prune_synced(older_than).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.store.queue_stats().await?)
    }

    pub async fn unresolved_conflicts(&self) -> Result<Vec<SyncConflict>> {
        Ok(self.store.unresolved_conflicts().await?)
    }
}

/// Payload the remote store holds once this entry is applied.
fn acknowledged_base(entry: &SyncQueueEntry) -> Option<Value> {
    match entry.operation {
        SyncOperation::Delete => None,
        SyncOperation::Create | SyncOperation::Update => Some(entry.data.clone()),
    }
}

/// The local side of a conflict; `None` for a local delete.
fn local_payload(entry: &SyncQueueEntry) -> Option<Value> {
    acknowledged_base(entry)
}

fn change_for(key: RecordKey, data: Option<Value>) -> LocalChange {
    match data {
        Some(data) => LocalChange::Upsert(Record::new(key, data)),
        None => LocalChange::Delete(key),
    }
}

fn local_wins_write(
    conflict: SyncConflict,
    entry: &SyncQueueEntry,
    winning: Option<Value>,
) -> ResolutionWrite {
    ResolutionWrite {
        conflict,
        local_change: change_for(entry.key(), winning.clone()),
        disposition: EntryDisposition::MarkSynced {
            entry_id: entry.id.clone(),
            synced_at: now_millis(),
        },
        base: winning,
    }
}

fn remote_wins_write(
    conflict: SyncConflict,
    entry: &SyncQueueEntry,
    remote_data: Option<Value>,
) -> ResolutionWrite {
    ResolutionWrite {
        conflict,
        local_change: change_for(entry.key(), remote_data.clone()),
        disposition: EntryDisposition::Discard {
            entry_id: entry.id.clone(),
        },
        base: remote_data,
    }
}
