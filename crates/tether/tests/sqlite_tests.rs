//! The durable store through the public API: reopen persistence and full
//! flows on SQLite

use serde_json::json;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tether::testing::{FakeRemoteStore, RecordingReporter, VecLegacySource};
use tether::{
    ConflictLog, ConflictResolver, ConflictStrategy, EntryStatus, LocalStore, MarkerStore,
    MigrationManager, MigrationOutcome, OfflineRepository, PushOutcome, RecordKey, RemoteRecord,
    Resolution, SqliteStore, SyncCoordinator, SyncQueueStore, SyncSettings,
};

#[tokio::test]
async fn test_state_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tether.db");

    let (entry_id, conflict_id) = {
        let store = Arc::new(SqliteStore::open(&path).await?);
        let remote = Arc::new(FakeRemoteStore::new());
        let coordinator = SyncCoordinator::new(
            store.clone(),
            remote.clone(),
            ConflictResolver::builder()
                .strategy("notes", ConflictStrategy::Manual)
                .build(),
            &SyncSettings::default(),
        )?;
        let repo = OfflineRepository::new(store.clone(), "device-A");

        let entry_id = repo.create("tasks", "t1", json!({"title": "offline"})).await?;
        repo.create("notes", "n1", json!({"body": "mine"})).await?;
        remote.script(
            &RecordKey::new("notes", "n1"),
            PushOutcome::VersionConflict(RemoteRecord::live(
                json!({"body": "theirs"}),
                tether::now_millis(),
            )),
        );
        store.set_marker("migration.completed.1").await?;

        assert_eq!(store.unsynced_entries().await?.len(), 2);
        let report = coordinator.drain_once().await?;
        assert_eq!(report.synced, 1);
        assert_eq!(report.pending_decisions, 1);

        let conflict_id = coordinator.unresolved_conflicts().await?.remove(0).id;
        store.close().await;
        (entry_id, conflict_id)
    };

    let store = SqliteStore::open(&path).await?;
    assert!(store.is_marked("migration.completed.1").await?);

    let entry = store.get_entry(&entry_id).await?.unwrap();
    assert!(entry.is_synced());
    assert_eq!(entry.device_id, "device-A");
    assert_eq!(
        store.get(&RecordKey::new("tasks", "t1")).await?.unwrap().data,
        json!({"title": "offline"})
    );

    let conflict = store.get_conflict(&conflict_id).await?.unwrap();
    assert!(!conflict.is_resolved());
    assert_eq!(conflict.remote_data, Some(json!({"body": "theirs"})));
    assert_eq!(store.queue_stats().await?.unresolved_conflicts, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_entries_persist_and_requeue() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tether.db");
    let settings = SyncSettings {
        max_retries: 1,
        ..SyncSettings::default()
    };

    let entry_id = {
        let store = Arc::new(SqliteStore::open(&path).await?);
        let remote = Arc::new(FakeRemoteStore::new());
        remote.set_offline(true);
        let coordinator =
            SyncCoordinator::new(store.clone(), remote, ConflictResolver::default(), &settings)?;
        let repo = OfflineRepository::new(store.clone(), "device-A");

        let entry_id = repo.create("tasks", "t1", json!({"v": 1})).await?;
        assert_eq!(coordinator.drain_once().await?.exhausted, 1);
        store.close().await;
        entry_id
    };

    let store = Arc::new(SqliteStore::open(&path).await?);
    let entry = store.get_entry(&entry_id).await?.unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.error.as_deref(), Some("remote unreachable"));

    let remote = Arc::new(FakeRemoteStore::new());
    let coordinator = SyncCoordinator::new(
        store.clone(),
        remote.clone(),
        ConflictResolver::default(),
        &settings,
    )?;
    assert_eq!(coordinator.drain_once().await?.sent, 0);
    assert_eq!(coordinator.queue().requeue_failed().await?, 1);
    assert_eq!(coordinator.drain_once().await?.synced, 1);
    assert_eq!(remote.pushed_ids(), vec![entry_id]);
    Ok(())
}

#[tokio::test]
async fn test_remote_wins_on_sqlite() -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new_in_memory().await?);
    let remote = Arc::new(FakeRemoteStore::new());
    let coordinator = SyncCoordinator::new(
        store.clone(),
        remote.clone(),
        ConflictResolver::default(),
        &SyncSettings::default(),
    )?;
    let repo = OfflineRepository::new(store.clone(), "A");
    let key = RecordKey::new("tasks", "t1");

    repo.create("tasks", "t1", json!({"title": "draft"})).await?;
    coordinator.drain_once().await?;
    let entry_id = repo.update("tasks", "t1", json!({"title": "local"})).await?;
    remote.script(
        &key,
        PushOutcome::VersionConflict(RemoteRecord::live(
            json!({"title": "remote"}),
            tether::now_millis() + ChronoDuration::minutes(1),
        )),
    );

    let report = coordinator.drain_once().await?;
    assert_eq!(report.resolved, 1);
    assert_eq!(store.get(&key).await?.unwrap().data, json!({"title": "remote"}));
    assert!(store.get_entry(&entry_id).await?.is_none());
    assert_eq!(store.sync_base(&key).await?, Some(json!({"title": "remote"})));

    let conflicts = store.conflicts_for(&key).await?;
    assert_eq!(conflicts[0].resolution, Some(Resolution::RemoteWins));
    Ok(())
}

#[tokio::test]
async fn test_migration_into_sqlite_runs_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tether.db");

    {
        let store = Arc::new(SqliteStore::open(&path).await?);
        let outcome = MigrationManager::builder(
            Arc::new(VecLegacySource::numbered("tasks", 120)),
            store.clone(),
            store.clone(),
        )
        .batch_size(50)
        .build()
        .migrate()
        .await?;
        assert!(matches!(
            outcome,
            MigrationOutcome::Completed {
                processed_records: 120,
                ..
            }
        ));
        store.close().await;
    }

    let store = Arc::new(SqliteStore::open(&path).await?);
    let source = Arc::new(VecLegacySource::numbered("tasks", 120));
    let reporter = RecordingReporter::new();
    let outcome = MigrationManager::builder(source.clone(), store.clone(), store.clone())
        .batch_size(50)
        .reporter(reporter.clone())
        .build()
        .migrate()
        .await?;

    assert_eq!(outcome, MigrationOutcome::AlreadyMigrated);
    assert!(source.reads().is_empty());
    assert_eq!(reporter.complete_count(), 1);
    assert!(store
        .get(&RecordKey::new("tasks", "r0119"))
        .await?
        .is_some());
    Ok(())
}
