use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use tether_api::SyncConflict;
use tether_core::{QueueStats, RemoteStore, SyncStore};

use super::backoff::BackoffPolicy;
use super::queue::{DrainReport, SyncQueue};
use super::resolver::{ConflictResolver, Decision};
use crate::config::SyncSettings;
use crate::error::Result;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications from the sync run loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    CycleCompleted(DrainReport),
    Error(String),
    Stopped,
}

#[derive(Debug, Default)]
struct SyncSignals {
    paused: AtomicBool,
    stopped: AtomicBool,
    retry_requested: AtomicBool,
    wake: Notify,
}

/// Cloneable control surface for `SyncCoordinator::run`.
///
/// All signals are fire-and-forget and may arrive in any order.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    signals: Arc<SyncSignals>,
}

impl SyncHandle {
    pub fn pause(&self) {
        self.signals.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.signals.paused.store(false, Ordering::SeqCst);
        self.signals.wake.notify_one();
    }

    /// End the run loop after the cycle in flight.
    pub fn stop(&self) {
        self.signals.stopped.store(true, Ordering::SeqCst);
        self.signals.wake.notify_one();
    }

    /// Requeue every `failed` entry and start a cycle.
    pub fn retry(&self) {
        self.signals.retry_requested.store(true, Ordering::SeqCst);
        self.signals.wake.notify_one();
    }

    /// Start a cycle now instead of waiting out the current delay.
    pub fn wake(&self) {
        self.signals.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.signals.paused.load(Ordering::SeqCst)
    }
}

/// Drives the sync queue: drain cycles, backoff, conflict decisions and
/// lifecycle events.
pub struct SyncCoordinator {
    queue: SyncQueue,
    backoff: BackoffPolicy,
    drain_limit: usize,
    poll_interval: Duration,
    signals: Arc<SyncSignals>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        remote: Arc<dyn RemoteStore>,
        resolver: ConflictResolver,
        settings: &SyncSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(
            "Sync coordinator for remote {} (drain limit {}, max retries {})",
            remote.remote_id(),
            settings.drain_limit,
            settings.max_retries
        );
        Ok(Self {
            queue: SyncQueue::new(store, remote, resolver, settings),
            backoff: BackoffPolicy::from(settings),
            drain_limit: settings.drain_limit,
            poll_interval: settings.poll_interval(),
            signals: Arc::new(SyncSignals::default()),
            events,
        })
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            signals: self.signals.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. A lagging consumer silently skips the events it
    /// missed.
    pub fn event_stream(&self) -> impl Stream<Item = SyncEvent> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Run one drain cycle.
    #[tracing::instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainReport> {
        self.queue.drain(self.drain_limit).await
    }

    /// Resolve a conflict parked for a user decision, then wake the run
    /// loop so the unblocked key drains.
    #[tracing::instrument(skip(self, decision))]
    pub async fn resolve_conflict(&self, conflict_id: &str, decision: Decision) -> Result<()> {
        self.queue.apply_decision(conflict_id, decision).await?;
        self.signals.wake.notify_one();
        Ok(())
    }

    pub async fn unresolved_conflicts(&self) -> Result<Vec<SyncConflict>> {
        self.queue.unresolved_conflicts().await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Drain until stopped.
    ///
    /// Between cycles the loop waits for the backoff delay of the least
    /// retried failing entry, or the poll interval when nothing failed, and
    /// cuts the wait short on any handle signal. Only an unavailable store
    /// ends the loop with an error.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        info!("Sync run loop started");
        loop {
            if self.signals.stopped.load(Ordering::SeqCst) {
                break;
            }
            if self.signals.paused.load(Ordering::SeqCst) {
                debug!("Sync paused");
                self.signals.wake.notified().await;
                continue;
            }

            if self.signals.retry_requested.swap(false, Ordering::SeqCst) {
                if let Err(err) = self.queue.requeue_failed().await {
                    if let Some(err) = self.check_fatal(err) {
                        return Err(err);
                    }
                }
            }

            let wait = match self.drain_once().await {
                Ok(report) => {
                    let wait = self.next_delay(&report);
                    self.emit(SyncEvent::CycleCompleted(report));
                    wait
                }
                Err(err) => match self.check_fatal(err) {
                    Some(err) => return Err(err),
                    None => self.poll_interval,
                },
            };

            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = self.signals.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Sync run loop stopped");
        self.emit(SyncEvent::Stopped);
        Ok(())
    }

    /// Report an error; returns it back if it ends the run.
    fn check_fatal(&self, err: crate::error::SyncError) -> Option<crate::error::SyncError> {
        self.emit(SyncEvent::Error(err.to_string()));
        if err.is_unrecoverable() {
            error!("Sync stopped: {}", err);
            self.emit(SyncEvent::Stopped);
            Some(err)
        } else {
            warn!("Sync cycle failed: {}", err);
            None
        }
    }

    fn next_delay(&self, report: &DrainReport) -> Duration {
        if let Some(retries) = report.lowest_failed_retries {
            return self.backoff.delay_for(retries);
        }
        if report.sent >= self.drain_limit {
            // Full batch: more entries are likely waiting
            return Duration::ZERO;
        }
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, SyncError};
    use crate::storage::MemoryStore;
    use crate::testing::FakeRemoteStore;
    use serde_json::json;
    use tether_api::SyncOperation;

    fn coordinator(store: &MemoryStore, remote: &Arc<FakeRemoteStore>) -> SyncCoordinator {
        SyncCoordinator::new(
            Arc::new(store.clone()),
            remote.clone(),
            ConflictResolver::default(),
            &SyncSettings {
                poll_interval_ms: 10,
                drain_limit: 2,
                ..SyncSettings::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_settings_that_would_spin() {
        let store = MemoryStore::new();
        let remote = Arc::new(FakeRemoteStore::new());
        for settings in [
            SyncSettings {
                drain_limit: 0,
                ..SyncSettings::default()
            },
            SyncSettings {
                poll_interval_ms: 0,
                ..SyncSettings::default()
            },
        ] {
            let result = SyncCoordinator::new(
                Arc::new(store.clone()),
                remote.clone(),
                ConflictResolver::default(),
                &settings,
            );
            assert!(matches!(
                result,
                Err(SyncError::Config(ConfigError::Invalid { .. }))
            ));
        }
    }

    #[test]
    fn test_next_delay() {
        let store = MemoryStore::new();
        let remote = Arc::new(FakeRemoteStore::new());
        let coordinator = coordinator(&store, &remote);

        assert_eq!(
            coordinator.next_delay(&DrainReport::default()),
            Duration::from_millis(10)
        );
        let full = DrainReport {
            sent: 2,
            synced: 2,
            ..DrainReport::default()
        };
        assert_eq!(coordinator.next_delay(&full), Duration::ZERO);
        let failing = DrainReport {
            sent: 1,
            transient_failures: 1,
            lowest_failed_retries: Some(2),
            ..DrainReport::default()
        };
        assert_eq!(coordinator.next_delay(&failing), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_run_drains_and_stops() {
        let store = MemoryStore::new();
        let remote = Arc::new(FakeRemoteStore::new());
        let coordinator = Arc::new(coordinator(&store, &remote));
        for i in 0..5 {
            coordinator
                .queue()
                .enqueue("tasks", &format!("t{}", i), SyncOperation::Create, json!({}), "A")
                .await
                .unwrap();
        }
        let mut events = coordinator.subscribe();
        let handle = coordinator.handle();

        let runner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };

        let mut synced = 0;
        while synced < 5 {
            if let SyncEvent::CycleCompleted(report) = events.recv().await.unwrap() {
                synced += report.synced;
            }
        }
        handle.stop();
        runner.await.unwrap().unwrap();
        assert_eq!(coordinator.stats().await.unwrap().synced, 5);

        loop {
            match events.recv().await.unwrap() {
                SyncEvent::Stopped => break,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_unavailable_store_ends_run() {
        let store = MemoryStore::new();
        let remote = Arc::new(FakeRemoteStore::new());
        let coordinator = coordinator(&store, &remote);
        let mut events = coordinator.subscribe();
        store.set_unavailable(true);

        let err = coordinator.run().await.unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Error(_)));
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Stopped);
    }

    #[tokio::test]
    async fn test_paused_run_waits_for_resume() {
        let store = MemoryStore::new();
        let remote = Arc::new(FakeRemoteStore::new());
        let coordinator = Arc::new(coordinator(&store, &remote));
        coordinator
            .queue()
            .enqueue("tasks", "t1", SyncOperation::Create, json!({}), "A")
            .await
            .unwrap();
        let handle = coordinator.handle();
        handle.pause();

        let runner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(remote.pushed_ids().len(), 0);

        let mut events = coordinator.subscribe();
        handle.resume();
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::CycleCompleted(_)
        ));
        handle.stop();
        runner.await.unwrap().unwrap();
        assert_eq!(remote.pushed_ids().len(), 1);
    }
}
