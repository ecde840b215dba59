//! Same-browser tabs see each other's timer without a network round trip.

use std::sync::Arc;
use std::time::Duration;

use trackline::backend::memory::MemoryBackend;
use trackline::storage::MemorySnapshotStore;

use crate::helpers::{World, wait_until};

#[tokio::test]
async fn sibling_tab_reflects_start_within_50ms() {
    let world = World::new();
    let tab_a = world.tab("ada").await;

    // Tab B talks to a server that never hears about the timer, so only the
    // broadcast can tell it.
    let isolated = MemoryBackend::new(Arc::new(world.clock.clone()));
    let tab_b = trackline::ClientSession::builder(crate::helpers::identity("ada"), isolated.factory())
        .clock(Arc::new(world.clock.clone()))
        .snapshot_store(Arc::new(MemorySnapshotStore::new()))
        .broadcast_hub(Arc::clone(&world.hub))
        .build()
        .await;
    let mut running = tab_b.watch_running();

    let started = tab_a.start("task", "T1", "Pair review").await.unwrap();
    wait_until(&mut running, Duration::from_millis(50), |r| r.is_some()).await;

    let adopted = tab_b.active_timer().unwrap();
    assert_eq!(adopted.entry_id, started.entry_id);
    assert_eq!(adopted.display_name, "Pair review");
    assert_eq!(isolated.connections_built(), 1);
    assert!(isolated.records().is_empty());
}

#[tokio::test]
async fn sibling_tab_reflects_stop() {
    let world = World::new();
    let tab_a = world.tab("ada").await;
    let tab_b = world.tab("ada").await;
    let mut running = tab_b.watch_running();

    tab_a.start("task", "T1", "x").await.unwrap();
    wait_until(&mut running, Duration::from_millis(200), |r| r.is_some()).await;
    tab_a.stop().await.unwrap();
    wait_until(&mut running, Duration::from_millis(200), |r| r.is_none()).await;
}

#[tokio::test]
async fn sibling_start_blocks_local_start() {
    let world = World::new();
    let tab_a = world.tab("ada").await;
    let tab_b = world.tab("ada").await;
    let mut running = tab_b.watch_running();

    tab_a.start("task", "T1", "x").await.unwrap();
    wait_until(&mut running, Duration::from_millis(200), |r| r.is_some()).await;

    let err = tab_b.start("task", "T2", "y").await.unwrap_err();
    assert!(matches!(err, trackline::SyncError::AlreadyRunning));
    assert_eq!(world.backend.records().len(), 1);
}

#[tokio::test]
async fn session_without_hub_still_works() {
    let world = World::new();
    let device = world.device("ada").await;
    device.start("task", "T1", "x").await.unwrap();
    device.stop().await.unwrap();
    assert_eq!(world.backend.open_count("ada"), 0);
}
