use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use tether_api::{
    LegacyRecord, MigrationProgress, MigrationState, Record, RecordKey, StorageError,
};
use tether_core::{LegacySource, LocalStore, MarkerStore, NoopReporter, ProgressReporter};

use super::control::{Checkpoint, MigrationControl, MigrationHandle};
use crate::config::MigrationSettings;
use crate::error::MigrationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub batch_size: usize,
    /// Pause between batches; zero still yields to the scheduler
    pub delay_between_batches: Duration,
    /// Namespaces the completion marker
    pub migration_version: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delay_between_batches: Duration::ZERO,
            migration_version: "1".to_string(),
        }
    }
}

impl From<&MigrationSettings> for MigrationConfig {
    fn from(settings: &MigrationSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            delay_between_batches: Duration::from_millis(settings.delay_between_batches_ms),
            migration_version: settings.version.clone(),
        }
    }
}

impl MigrationConfig {
    pub fn marker_name(&self) -> String {
        format!("migration.completed.{}", self.migration_version)
    }
}

/// How a migration run ended, short of failing.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    Completed {
        processed_records: usize,
        errors: Vec<String>,
    },
    /// The completion marker was already set; nothing was read or written
    AlreadyMigrated,
    Cancelled { processed_records: usize },
}

/// Copies every record of a legacy source into the local store, one batch at
/// a time.
///
/// A manager runs once. Pause, resume and cancel arrive through a
/// [`MigrationHandle`] and take effect between batches.
pub struct MigrationManager {
    source: Arc<dyn LegacySource>,
    store: Arc<dyn LocalStore>,
    markers: Arc<dyn MarkerStore>,
    reporter: Arc<dyn ProgressReporter>,
    config: MigrationConfig,
    control: Arc<MigrationControl>,
    progress: Mutex<Option<MigrationProgress>>,
    outcome: Mutex<Option<MigrationOutcome>>,
}

pub struct MigrationManagerBuilder {
    source: Arc<dyn LegacySource>,
    store: Arc<dyn LocalStore>,
    markers: Arc<dyn MarkerStore>,
    reporter: Arc<dyn ProgressReporter>,
    config: MigrationConfig,
}

impl MigrationManagerBuilder {
    pub fn config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn delay_between_batches(mut self, delay: Duration) -> Self {
        self.config.delay_between_batches = delay;
        self
    }

    pub fn migration_version(mut self, version: impl Into<String>) -> Self {
        self.config.migration_version = version.into();
        self
    }

    pub fn reporter(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn shared_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// The configuration is checked when `migrate()` runs, so a bad value
    /// is reported through `on_error` like any other failure.
    pub fn build(self) -> MigrationManager {
        MigrationManager {
            source: self.source,
            store: self.store,
            markers: self.markers,
            reporter: self.reporter,
            config: self.config,
            control: Arc::new(MigrationControl::new()),
            progress: Mutex::new(None),
            outcome: Mutex::new(None),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MigrationManager {
    pub fn builder(
        source: Arc<dyn LegacySource>,
        store: Arc<dyn LocalStore>,
        markers: Arc<dyn MarkerStore>,
    ) -> MigrationManagerBuilder {
        MigrationManagerBuilder {
            source,
            store,
            markers,
            reporter: Arc::new(NoopReporter),
            config: MigrationConfig::default(),
        }
    }

    pub fn handle(&self) -> MigrationHandle {
        MigrationHandle::new(self.control.clone())
    }

    pub fn state(&self) -> MigrationState {
        self.control.state()
    }

    /// Latest progress snapshot. `None` before the run starts and after it
    /// completes or is cancelled.
    pub fn progress(&self) -> Option<MigrationProgress> {
        lock(&self.progress).clone()
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Run the migration to a terminal state.
    ///
    /// Calling this again after the run started does nothing: a finished run
    /// returns its outcome again, a live or failed one returns
    /// `MigrationError::AlreadyStarted`.
    #[tracing::instrument(
        skip(self),
        fields(source = %self.source.source_name(), version = %self.config.migration_version)
    )]
    pub async fn migrate(&self) -> Result<MigrationOutcome, MigrationError> {
        if let Err(state) = self.control.start() {
            warn!("migrate() called while {}; ignoring", state);
            return match lock(&self.outcome).clone() {
                Some(outcome) => Ok(outcome),
                None => Err(MigrationError::AlreadyStarted(state)),
            };
        }

        match self.run().await {
            Ok(outcome) => {
                *lock(&self.outcome) = Some(outcome.clone());
                Ok(outcome)
            }
            Err(err) => {
                error!("Migration failed: {}", err);
                self.control.finish(MigrationState::Failed);
                self.reporter.on_error(&err);
                Err(err)
            }
        }
    }

    async fn run(&self) -> Result<MigrationOutcome, MigrationError> {
        let batch_size = self.config.batch_size;
        if batch_size == 0 {
            return Err(MigrationError::InvalidConfig(
                "batch_size must be greater than zero".to_string(),
            ));
        }

        let marker = self.config.marker_name();
        if self.markers.is_marked(&marker).await? {
            info!("Marker {} already set, skipping migration", marker);
            return Ok(self.complete(MigrationOutcome::AlreadyMigrated));
        }

        let source_name = self.source.source_name().to_string();
        *lock(&self.progress) = Some(MigrationProgress::new(format!(
            "Starting migration from {}",
            source_name
        )));
        info!("Migrating from {} in batches of {}", source_name, batch_size);

        let mut offset = 0;
        let mut batch_number = 0;
        loop {
            if self.control.checkpoint().await == Checkpoint::Cancel {
                return Ok(self.cancel());
            }

            let batch = self
                .source
                .read_batch(offset, batch_size)
                .await
                .map_err(|error| MigrationError::Source {
                    source_name: source_name.clone(),
                    offset,
                    error,
                })?;

            let read = batch.records.len();
            if read == 0 {
                debug!("Source exhausted at offset {}", offset);
                break;
            }
            batch_number += 1;

            let failures = self.write_batch(batch.records).await?;
            offset += read;

            let snapshot = {
                let mut guard = lock(&self.progress);
                let progress = guard.get_or_insert_with(|| MigrationProgress::new(""));
                if let Some(total) = batch.total_hint {
                    progress.update_total(total);
                }
                progress.advance(read);
                progress.errors.extend(failures);
                progress.current_step = format!("Migrated batch {}", batch_number);
                progress.clone()
            };
            debug!(
                "Batch {} done: {} processed, {:.1}%",
                batch_number,
                snapshot.processed_records,
                snapshot.percent_complete()
            );
            self.reporter.on_progress(&snapshot);

            if self.config.delay_between_batches.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.delay_between_batches).await;
            }
        }

        self.markers.set_marker(&marker).await?;

        let (processed_records, errors) = lock(&self.progress)
            .take()
            .map(|p| (p.processed_records, p.errors))
            .unwrap_or_default();
        info!(
            "Migration complete: {} records, {} failed",
            processed_records,
            errors.len()
        );
        Ok(self.complete(MigrationOutcome::Completed {
            processed_records,
            errors,
        }))
    }

    /// Upsert one batch. Returns the per-record failures; an unavailable
    /// store fails the whole batch.
    async fn write_batch(&self, records: Vec<LegacyRecord>) -> Result<Vec<String>, MigrationError> {
        let mut failures = Vec::new();
        for legacy in records {
            let key = RecordKey::new(legacy.table_name, legacy.record_id);
            let label = key.to_string();
            match self.store.upsert(Record::new(key, legacy.data)).await {
                Ok(()) => {}
                Err(err) if err.is_unavailable() => return Err(MigrationError::Store(err)),
                Err(err) => {
                    warn!("Skipping record {}: {}", label, err);
                    failures.push(describe_failure(&label, &err));
                }
            }
        }
        Ok(failures)
    }

    fn complete(&self, outcome: MigrationOutcome) -> MigrationOutcome {
        *lock(&self.progress) = None;
        self.control.finish(MigrationState::Completed);
        self.reporter.on_complete();
        outcome
    }

    fn cancel(&self) -> MigrationOutcome {
        let processed_records = lock(&self.progress)
            .take()
            .map(|p| p.processed_records)
            .unwrap_or(0);
        info!("Migration cancelled after {} records", processed_records);
        self.control.finish(MigrationState::Cancelled);
        self.reporter.on_cancelled();
        MigrationOutcome::Cancelled { processed_records }
    }
}

fn describe_failure(label: &str, err: &StorageError) -> String {
    format!("{}: {}", label, err)
}
