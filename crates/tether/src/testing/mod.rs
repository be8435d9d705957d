//! Test doubles for the external collaborators
//!
//! - `FakeRemoteStore`: scriptable remote with a record map and push log
//! - `VecLegacySource`: legacy source over a vector, with read hooks
//! - `RecordingReporter`: keeps every reporter notification

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tether_api::{
    LegacyBatch, LegacyRecord, MigrationProgress, PushOutcome, RecordKey, RemoteRecord,
    StorageError, StorageResult, SyncOperation, SyncQueueEntry,
};
use tether_core::{LegacySource, ProgressReporter, RemoteStore};

use crate::migration::MigrationEvent;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process remote store.
///
/// Pushes are accepted and applied unless an outcome was scripted for the
/// entry's key; scripted outcomes are consumed in order.
#[derive(Debug, Default)]
pub struct FakeRemoteStore {
    records: Mutex<HashMap<RecordKey, RemoteRecord>>,
    scripted: Mutex<HashMap<RecordKey, VecDeque<PushOutcome>>>,
    pushed: Mutex<Vec<String>>,
    forced: Mutex<Vec<(RecordKey, Option<Value>)>>,
    offline: AtomicBool,
    fail_force: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl FakeRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next push of `key`.
    pub fn script(&self, key: &RecordKey, outcome: PushOutcome) {
        lock(&self.scripted)
            .entry(key.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Every push fails transiently while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_force_push(&self, fail: bool) {
        self.fail_force.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    pub fn set_remote(&self, key: &RecordKey, record: RemoteRecord) {
        lock(&self.records).insert(key.clone(), record);
    }

    pub fn remote_record(&self, key: &RecordKey) -> Option<RemoteRecord> {
        lock(&self.records).get(key).cloned()
    }

    /// Entry ids passed to `push`, in call order.
    pub fn pushed_ids(&self) -> Vec<String> {
        lock(&self.pushed).clone()
    }

    pub fn force_pushes(&self) -> Vec<(RecordKey, Option<Value>)> {
        lock(&self.forced).clone()
    }

    fn apply(&self, key: RecordKey, data: Option<Value>) {
        let record = match data {
            Some(data) => RemoteRecord::live(data, tether_api::now_millis()),
            None => RemoteRecord::tombstone(tether_api::now_millis()),
        };
        lock(&self.records).insert(key, record);
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for FakeRemoteStore {
    async fn push(&self, entry: &SyncQueueEntry) -> PushOutcome {
        lock(&self.pushed).push(entry.id.clone());
        self.simulate_latency().await;

        if self.offline.load(Ordering::SeqCst) {
            return PushOutcome::TransientError("remote unreachable".to_string());
        }

        let key = entry.key();
        let scripted = lock(&self.scripted)
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        let outcome = scripted.unwrap_or(PushOutcome::Accepted);

        if outcome == PushOutcome::Accepted {
            let data = match entry.operation {
                SyncOperation::Delete => None,
                SyncOperation::Create | SyncOperation::Update => Some(entry.data.clone()),
            };
            self.apply(key, data);
        }
        outcome
    }

    async fn force_push(&self, entry: &SyncQueueEntry, resolved: Option<&Value>) -> PushOutcome {
        self.simulate_latency().await;
        if self.offline.load(Ordering::SeqCst) || self.fail_force.load(Ordering::SeqCst) {
            return PushOutcome::TransientError("remote rejected resolution".to_string());
        }
        lock(&self.forced).push((entry.key(), resolved.cloned()));
        self.apply(entry.key(), resolved.cloned());
        PushOutcome::Accepted
    }

    fn remote_id(&self) -> &str {
        "remote-fake"
    }
}

type ReadHook = Box<dyn Fn(usize) + Send + Sync>;

/// Legacy source backed by a vector.
#[derive(Default)]
pub struct VecLegacySource {
    records: Vec<LegacyRecord>,
    report_total: bool,
    fail_at: Option<usize>,
    page_cap: Option<usize>,
    reads: Mutex<Vec<usize>>,
    hook: Option<ReadHook>,
}

impl VecLegacySource {
    pub fn new(records: Vec<LegacyRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    /// `count` records in `table`, with ids `r0000`, `r0001`, ...
    pub fn numbered(table: &str, count: usize) -> Self {
        let records = (0..count)
            .map(|i| {
                LegacyRecord::new(
                    table,
                    format!("r{:04}", i),
                    json!({ "n": i, "title": format!("Item {}", i) }),
                )
            })
            .collect();
        Self::new(records)
    }

    /// Report the record count with every page.
    pub fn with_total_hint(mut self) -> Self {
        self.report_total = true;
        self
    }

    /// Fail the read that starts at `offset`.
    pub fn fail_at_offset(mut self, offset: usize) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// Return at most `cap` records per page whatever limit is asked for.
    pub fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = Some(cap);
        self
    }

    /// Run `hook` with the offset at the start of every read.
    pub fn with_read_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Offsets read so far, in order.
    pub fn reads(&self) -> Vec<usize> {
        lock(&self.reads).clone()
    }
}

#[async_trait]
impl LegacySource for VecLegacySource {
    async fn read_batch(&self, offset: usize, limit: usize) -> StorageResult<LegacyBatch> {
        lock(&self.reads).push(offset);
        if let Some(hook) = &self.hook {
            hook(offset);
        }
        if self.fail_at == Some(offset) {
            return Err(StorageError::Unavailable(format!(
                "legacy source failed at offset {}",
                offset
            )));
        }

        let limit = self.page_cap.map_or(limit, |cap| limit.min(cap));
        let start = offset.min(self.records.len());
        let end = offset.saturating_add(limit).min(self.records.len());
        Ok(LegacyBatch {
            records: self.records[start..end].to_vec(),
            total_hint: self.report_total.then_some(self.records.len()),
        })
    }

    fn source_name(&self) -> &str {
        "vec-legacy"
    }
}

/// Reporter that records every notification. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<MigrationEvent>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MigrationEvent> {
        lock(&self.events).clone()
    }

    pub fn progress_snapshots(&self) -> Vec<MigrationProgress> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                MigrationEvent::Progress(progress) => Some(progress.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn processed_counts(&self) -> Vec<usize> {
        self.progress_snapshots()
            .iter()
            .map(|p| p.processed_records)
            .collect()
    }

    pub fn error_count(&self) -> usize {
        self.count(|e| matches!(e, MigrationEvent::Error(_)))
    }

    pub fn complete_count(&self) -> usize {
        self.count(|e| matches!(e, MigrationEvent::Completed))
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(|e| matches!(e, MigrationEvent::Cancelled))
    }

    fn count(&self, predicate: impl Fn(&MigrationEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| predicate(e)).count()
    }

    fn record(&self, event: MigrationEvent) {
        lock(&self.events).push(event);
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_progress(&self, progress: &MigrationProgress) {
        self.record(MigrationEvent::Progress(progress.clone()));
    }

    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync + 'static)) {
        self.record(MigrationEvent::Error(error.to_string()));
    }

    fn on_complete(&self) {
        self.record(MigrationEvent::Completed);
    }

    fn on_cancelled(&self) {
        self.record(MigrationEvent::Cancelled);
    }
}
