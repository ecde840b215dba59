//! One running timer per owner, across tabs and devices.

use std::time::Duration;

use trackline::{SyncError, format_elapsed};

use crate::helpers::{World, wait_until};

#[tokio::test]
async fn elapsed_display_and_server_duration() {
    let world = World::new();
    let session = world.device("ada").await;

    session.start("task", "T1", "Write report").await.unwrap();
    world.clock.advance(Duration::from_secs(65));
    session.timer().tick();
    assert_eq!(session.elapsed_display(), "1:05");

    let closed = session.stop().await.unwrap();
    assert_eq!(closed.duration_secs, Some(65));
    let stored = world
        .backend
        .records()
        .into_iter()
        .find(|r| r.id == closed.id)
        .unwrap();
    assert_eq!(stored.duration_secs, Some(65));
    assert_eq!(stored.end_time, Some(stored.start_time + chrono::Duration::seconds(65)));
}

#[tokio::test]
async fn duration_ignores_client_clock_drift() {
    let world = World::new();
    // This device's clock runs ten minutes fast.
    let drifting = trackline::clock::ManualClock::new(
        crate::helpers::t0() + chrono::Duration::minutes(10),
    );
    let session = trackline::ClientSession::builder(
        crate::helpers::identity("ada"),
        world.backend.factory(),
    )
    .clock(std::sync::Arc::new(drifting))
    .snapshot_store(std::sync::Arc::new(
        trackline::storage::MemorySnapshotStore::new(),
    ))
    .build()
    .await;

    session.start("task", "T1", "x").await.unwrap();
    world.clock.advance(Duration::from_secs(30));
    let closed = session.stop().await.unwrap();
    assert_eq!(closed.duration_secs, Some(30));
}

#[tokio::test]
async fn simultaneous_start_in_two_tabs() {
    let world = World::new();
    let tab_a = world.tab("ada").await;
    let tab_b = world.tab("ada").await;
    // Both inserts are in flight before either lands, so both tabs pass
    // the local pre-check.
    world.backend.set_latency(Duration::from_millis(20));

    let (a, b) = tokio::join!(
        tab_a.start("task", "T1", "from A"),
        tab_b.start("task", "T2", "from B"),
    );

    let (winner, loser, loser_err) = match (a, b) {
        (Ok(w), Err(e)) => (w, &tab_b, e),
        (Err(e), Ok(w)) => (w, &tab_a, e),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert!(matches!(loser_err, SyncError::AlreadyRunning));
    assert_eq!(world.backend.open_count("ada"), 1);
    assert_eq!(loser.active_timer().unwrap().entry_id, winner.entry_id);
}

#[tokio::test]
async fn many_devices_racing_leave_one_open_record() {
    let world = World::new();
    world.backend.set_latency(Duration::from_millis(5));
    let mut devices = Vec::new();
    for _ in 0..5 {
        devices.push(world.device("ada").await);
    }

    let results = futures_util::future::join_all(
        devices
            .iter()
            .enumerate()
            .map(|(i, d)| async move { d.start("task", &format!("T{i}"), "race").await }),
    )
    .await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, SyncError::AlreadyRunning))
    );
    assert_eq!(world.backend.open_count("ada"), 1);
}

#[tokio::test]
async fn owners_do_not_block_each_other() {
    let world = World::new();
    let ada = world.device("ada").await;
    let bob = world.device("bob").await;
    ada.start("task", "T1", "a").await.unwrap();
    bob.start("task", "T1", "b").await.unwrap();
    assert_eq!(world.backend.open_count("ada"), 1);
    assert_eq!(world.backend.open_count("bob"), 1);
}

#[tokio::test]
async fn change_feed_reaches_other_device() {
    let world = World::new();
    let phone = world.device("ada").await;
    let laptop = world.device("ada").await;
    let mut running = laptop.watch_running();

    let started = phone.start("task", "T1", "x").await.unwrap();
    wait_until(&mut running, Duration::from_secs(1), |r| r.is_some()).await;
    assert_eq!(laptop.active_timer().unwrap().entry_id, started.entry_id);

    phone.stop().await.unwrap();
    wait_until(&mut running, Duration::from_secs(1), |r| r.is_none()).await;
    assert!(!laptop.is_running());
}

#[tokio::test]
async fn duplicate_feed_delivery_settles_to_same_state() {
    let world = World::new();
    world.backend.set_duplicate_delivery(true);
    let phone = world.device("ada").await;
    let laptop = world.device("ada").await;
    let mut running = laptop.watch_running();

    phone.start("task", "T1", "x").await.unwrap();
    wait_until(&mut running, Duration::from_secs(1), |r| r.is_some()).await;
    let first = laptop.active_timer();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(laptop.active_timer(), first);
    assert_eq!(world.backend.open_count("ada"), 1);
}

#[tokio::test]
async fn stop_on_device_that_missed_remote_stop() {
    let world = World::new();
    let session = world.device("ada").await;
    let started = session.start("task", "T1", "x").await.unwrap();
    world.backend.close_directly(started.entry_id);

    // Whichever happens first, feed reconcile or our stop, the outcome is
    // the same: nothing left running.
    let outcome = session.stop().await;
    assert!(matches!(outcome, Err(SyncError::NoActiveTimer)));
    assert!(!session.is_running());
}

#[test]
fn long_durations_use_hours() {
    assert_eq!(format_elapsed(2 * 3600 + 5), "2:00:05");
}
