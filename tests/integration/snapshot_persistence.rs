//! The running timer survives a reload and never outlives the backend's
//! view of it.

use std::sync::Arc;

use trackline::storage::{FileSnapshotStore, LocalTimerCache, SnapshotStore};
use trackline::{ClientSession, SyncConfig};

use crate::helpers::{World, identity};

async fn file_session(world: &World, dir: &std::path::Path) -> ClientSession {
    let mut config = SyncConfig::default();
    config.storage.dir = Some(dir.to_path_buf());
    ClientSession::builder(identity("ada"), world.backend.factory())
        .config(config)
        .clock(Arc::new(world.clock.clone()))
        .build()
        .await
}

#[tokio::test]
async fn reload_restores_running_timer_from_disk() {
    let world = World::new();
    let temp = tempfile::tempdir().expect("tempdir");

    let before = file_session(&world, temp.path()).await;
    let started = before.start("task", "T1", "Budget review").await.unwrap();
    assert!(temp.path().join("trackline.active_timer.json").exists());
    drop(before);

    let after = file_session(&world, temp.path()).await;
    let restored = after.active_timer().expect("restored");
    assert_eq!(restored.entry_id, started.entry_id);
    assert_eq!(restored.display_name, "Budget review");
}

#[tokio::test]
async fn stale_cache_is_cleared_on_reload() {
    let world = World::new();
    let temp = tempfile::tempdir().expect("tempdir");

    let before = file_session(&world, temp.path()).await;
    let started = before.start("task", "T1", "x").await.unwrap();
    drop(before);
    // Stopped on another device while this one was closed.
    world.backend.close_directly(started.entry_id);

    let after = file_session(&world, temp.path()).await;
    assert!(!after.is_running());
    assert!(!temp.path().join("trackline.active_timer.json").exists());
}

#[tokio::test]
async fn corrupt_snapshot_is_ignored_and_removed() {
    let world = World::new();
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileSnapshotStore::new(temp.path());
    store
        .write("trackline.active_timer", r#"{"entry_id":"not-a-uuid","entity_type":"task"}"#)
        .unwrap();

    let session = file_session(&world, temp.path()).await;
    assert!(!session.is_running());
    let cache = LocalTimerCache::new(Arc::new(store.clone()), "trackline.active_timer");
    assert!(cache.get().is_none());
    assert!(store.read("trackline.active_timer").unwrap().is_none());

    // And the session can start normally afterwards.
    session.start("task", "T1", "fresh").await.unwrap();
    assert!(cache.get().is_some());
}
