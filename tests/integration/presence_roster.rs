//! Who is viewing an entity.

use std::time::Duration;

use trackline::RecoveryStatus;
use trackline::backend::EntityRef;
use trackline::clock::Clock;
use trackline::presence::PresenceEntry;

use crate::helpers::{World, identity, wait_until};

fn names(roster: &[PresenceEntry]) -> Vec<String> {
    roster.iter().map(|e| e.display_name.clone()).collect()
}

/// Move the server clock and tokio time forward together in small steps so
/// heartbeats and sweeps see consistent timestamps.
async fn advance(world: &World, total: Duration) {
    let step = Duration::from_secs(5);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        world.clock.advance(step);
        tokio::time::sleep(step).await;
        elapsed += step;
    }
}

#[tokio::test(start_paused = true)]
async fn viewers_see_each_other_self_first() {
    let world = World::new();
    let task = EntityRef::new("task", "T1");
    let zed = world.device("zed").await;
    let ada = world.device("ada").await;

    let zed_view = zed.join_presence(task.clone()).await.unwrap();
    let ada_view = ada.join_presence(task.clone()).await.unwrap();

    let mut roster = zed_view.watch();
    wait_until(&mut roster, Duration::from_secs(1), |r| r.len() == 2).await;
    assert_eq!(names(&zed_view.roster()), ["Zed", "Ada"]);
    assert!(zed_view.has_other_viewers());

    let mut roster = ada_view.watch();
    wait_until(&mut roster, Duration::from_secs(1), |r| r.len() == 2).await;
    assert_eq!(names(&ada_view.roster()), ["Ada", "Zed"]);
    assert_eq!(names(&ada_view.others()), ["Zed"]);
}

#[tokio::test(start_paused = true)]
async fn alone_means_no_other_viewers() {
    let world = World::new();
    let ada = world.device("ada").await;
    let view = ada.join_presence(EntityRef::new("task", "T1")).await.unwrap();

    let mut roster = view.watch();
    wait_until(&mut roster, Duration::from_secs(1), |r| r.len() == 1).await;
    assert!(!view.has_other_viewers());
    assert!(view.others().is_empty());
}

#[tokio::test(start_paused = true)]
async fn same_user_in_two_tabs_is_listed_once() {
    let world = World::new();
    let task = EntityRef::new("task", "T1");
    let tab_a = world.tab("ada").await;
    let tab_b = world.tab("ada").await;
    let bob = world.device("bob").await;

    let _a = tab_a.join_presence(task.clone()).await.unwrap();
    let _b = tab_b.join_presence(task.clone()).await.unwrap();
    let bob_view = bob.join_presence(task.clone()).await.unwrap();

    let mut roster = bob_view.watch();
    wait_until(&mut roster, Duration::from_secs(1), |r| r.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(names(&bob_view.roster()), ["Bob", "Ada"]);
}

#[tokio::test(start_paused = true)]
async fn silent_viewer_is_swept_without_new_snapshot() {
    let world = World::new();
    let task = EntityRef::new("task", "T1");
    let ada = world.device("ada").await;
    let view = ada.join_presence(task.clone()).await.unwrap();

    // A remote viewer publishes once, then loses connectivity.
    let bob = identity("bob");
    world.backend.track_directly(
        &task.presence_topic(),
        "bob-phone",
        PresenceEntry {
            user_id: bob.user_id,
            display_name: bob.display_name,
            avatar_ref: bob.avatar_ref,
            last_active: world.clock.now(),
        },
    );
    let mut roster = view.watch();
    wait_until(&mut roster, Duration::from_secs(1), |r| r.len() == 2).await;

    advance(&world, Duration::from_secs(25)).await;
    assert!(view.has_other_viewers(), "still fresh at 25s");

    advance(&world, Duration::from_secs(20)).await;
    assert!(!view.has_other_viewers(), "stale entry swept by 45s");
    assert_eq!(names(&view.roster()), ["Ada"]);
}

#[tokio::test(start_paused = true)]
async fn dropped_session_ages_out_of_rosters() {
    let world = World::new();
    let task = EntityRef::new("task", "T1");
    let ada = world.device("ada").await;
    let bob = world.device("bob").await;

    let ada_view = ada.join_presence(task.clone()).await.unwrap();
    let bob_view = bob.join_presence(task.clone()).await.unwrap();
    let mut roster = ada_view.watch();
    wait_until(&mut roster, Duration::from_secs(1), |r| r.len() == 2).await;

    bob_view.leave();
    advance(&world, Duration::from_secs(60)).await;
    assert_eq!(names(&ada_view.roster()), ["Ada"]);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_viewer_listed() {
    let world = World::new();
    let task = EntityRef::new("task", "T1");
    let ada = world.device("ada").await;
    let bob = world.device("bob").await;

    let ada_view = ada.join_presence(task.clone()).await.unwrap();
    let _bob_view = bob.join_presence(task.clone()).await.unwrap();

    advance(&world, Duration::from_secs(120)).await;
    assert_eq!(names(&ada_view.roster()), ["Ada", "Bob"]);
}

#[tokio::test(start_paused = true)]
async fn roster_survives_connection_rebuild() {
    let world = World::new();
    let task = EntityRef::new("task", "T1");
    let ada = world.device("ada").await;
    let bob = world.device("bob").await;

    let ada_view = ada.join_presence(task.clone()).await.unwrap();
    let _bob_view = bob.join_presence(task.clone()).await.unwrap();
    let mut roster = ada_view.watch();
    wait_until(&mut roster, Duration::from_secs(1), |r| r.len() == 2).await;

    // Both devices slept; their roster feeds are attached to dead handles
    // that never close.
    world.backend.zombify_connections();
    assert_eq!(ada.request_recovery().await, RecoveryStatus::Healthy);
    assert_eq!(bob.request_recovery().await, RecoveryStatus::Healthy);

    advance(&world, Duration::from_secs(120)).await;
    assert_eq!(names(&ada_view.roster()), ["Ada", "Bob"]);
}
