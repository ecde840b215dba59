//! Dormancy, zombie connections and degraded mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use trackline::{AuthConfidence, RecoveryStatus, Visibility};

use crate::helpers::{World, wait_until};

#[tokio::test(start_paused = true)]
async fn ten_second_dormancy_runs_full_sequence() {
    let world = World::new();
    let session = world.device("ada").await;
    let refreshes = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let refreshes = Arc::clone(&refreshes);
        session.subscribe_to_refresh(move |_| {
            refreshes.fetch_add(1, Ordering::SeqCst);
        })
    };
    let mut state = session.watch_recovery();

    session.on_visibility_change(Visibility::Hidden);
    tokio::time::sleep(Duration::from_secs(10)).await;
    session.on_visibility_change(Visibility::Visible);

    wait_until(&mut state, Duration::from_secs(5), |s| {
        s.last_recovery_at.is_some()
    })
    .await;
    let state = session.recovery_state();
    assert_eq!(state.status, RecoveryStatus::Healthy);
    assert!(state.connection_healthy);
    assert_eq!(state.auth_confidence, AuthConfidence::Cached);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn half_second_dormancy_does_not_recover() {
    let world = World::new();
    let session = world.device("ada").await;

    session.on_visibility_change(Visibility::Hidden);
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.on_visibility_change(Visibility::Visible);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(session.recovery().run_count(), 0);
    assert_eq!(session.recovery_status(), RecoveryStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn two_cycles_within_debounce_window_recover_once() {
    let world = World::new();
    let session = world.device("ada").await;

    session.on_visibility_change(Visibility::Hidden);
    tokio::time::sleep(Duration::from_secs(3)).await;
    session.on_visibility_change(Visibility::Visible);
    tokio::time::sleep(Duration::from_millis(15)).await;
    session.on_visibility_change(Visibility::Hidden);
    tokio::time::sleep(Duration::from_millis(15)).await;
    session.on_visibility_change(Visibility::Visible);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(session.recovery().run_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn zombie_connection_is_rebuilt_during_recovery() {
    let world = World::new();
    let session = world.device("ada").await;
    let built_before = world.backend.connections_built();
    world.backend.zombify_connections();

    assert_eq!(session.request_recovery().await, RecoveryStatus::Healthy);
    assert_eq!(world.backend.connections_built(), built_before + 1);
    assert!(session.is_connection_healthy());
}

#[tokio::test(start_paused = true)]
async fn failed_retry_leaves_session_degraded() {
    let world = World::new();
    let session = world.device("ada").await;
    // Every call now outlives the probe budget, old handle or new.
    world.backend.zombify_connections();
    world.backend.set_latency(Duration::from_secs(60));

    assert_eq!(session.request_recovery().await, RecoveryStatus::Degraded);
    let state = session.recovery_state();
    assert!(!state.connection_healthy);
    assert!(state.last_recovery_at.is_none());
    assert!(session.is_degraded());
    assert!(session.should_queue_mutation());

    // Once the network is back, the next run clears degraded mode.
    world.backend.set_latency(Duration::ZERO);
    assert_eq!(session.request_recovery().await, RecoveryStatus::Healthy);
    assert!(!session.should_queue_mutation());
}

#[tokio::test(start_paused = true)]
async fn refresh_resubscribes_change_feed() {
    let world = World::new();
    let laptop = world.device("ada").await;
    let phone = world.device("ada").await;

    // The laptop slept; its feed is attached to a dead handle.
    world.backend.zombify_connections();
    assert_eq!(laptop.request_recovery().await, RecoveryStatus::Healthy);
    // The phone needs a live handle too before it can write.
    assert_eq!(phone.request_recovery().await, RecoveryStatus::Healthy);

    let mut running = laptop.watch_running();
    phone.start("task", "T1", "x").await.unwrap();
    wait_until(&mut running, Duration::from_secs(1), |r| r.is_some()).await;
}

#[tokio::test(start_paused = true)]
async fn refresh_reconciles_missed_changes() {
    let world = World::new();
    let laptop = world.device("ada").await;
    let phone = world.device("ada").await;

    // Laptop's handles go dead, so it misses the phone's start entirely.
    world.backend.zombify_connections();
    phone.request_recovery().await;
    phone.start("task", "T1", "x").await.unwrap();
    assert!(!laptop.is_running());

    let mut running = laptop.watch_running();
    laptop.on_visibility_change(Visibility::Hidden);
    tokio::time::sleep(Duration::from_secs(30)).await;
    laptop.on_visibility_change(Visibility::Visible);
    wait_until(&mut running, Duration::from_secs(10), |r| r.is_some()).await;
}

#[tokio::test(start_paused = true)]
async fn network_failure_on_write_requests_recovery() {
    let world = World::new();
    let session = world.device("ada").await;
    world.backend.set_unreachable(true);

    let err = session.start("task", "T1", "x").await.unwrap_err();
    assert!(err.is_connection_class());

    let mut state = session.watch_recovery();
    wait_until(&mut state, Duration::from_secs(10), |s| {
        s.status == RecoveryStatus::Degraded
    })
    .await;
    assert!(session.should_queue_mutation());
}
