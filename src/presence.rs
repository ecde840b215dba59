//! Per-entity viewer roster.
//!
//! Each session viewing an entity publishes `{user, display name, avatar,
//! last active}` on the entity's presence topic and re-publishes it on a
//! heartbeat. Incoming roster snapshots are flattened across replicas (one
//! per tab or device), deduplicated per user keeping the freshest entry,
//! stripped of stale entries, and sorted with the local user first.
//!
//! A remote viewer that loses connectivity simply stops heart-beating and
//! no new snapshot arrives to announce it, so the roster is also swept on
//! its own timer. Leaving is implicit: a dropped [`PresenceSession`] stops
//! heart-beating and ages out of everyone else's roster.
//!
//! A roster feed opened on a connection that later went dormant can stay
//! open and silent forever. Every recovery refresh therefore re-publishes
//! self and re-subscribes each joined topic on the current connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::backend::{EntityRef, RosterSnapshot};
use crate::clock::SharedClock;
use crate::config::{PresenceConfig, TimeoutConfig};
use crate::error::Result;
use crate::health::{ConnectionHealthMonitor, within_budget};
use crate::recovery::RefreshSignal;

/// One viewer as published on a presence topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub last_active: DateTime<Utc>,
}

/// Who the local session is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceIdentity {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl PresenceIdentity {
    fn entry_at(&self, now: DateTime<Utc>) -> PresenceEntry {
        PresenceEntry {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            avatar_ref: self.avatar_ref.clone(),
            last_active: now,
        }
    }
}

/// Reduce a raw roster snapshot to the list shown to the user.
pub fn reconcile_roster(
    snapshot: &RosterSnapshot,
    self_user_id: &str,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Vec<PresenceEntry> {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);

    let mut latest: HashMap<&str, &PresenceEntry> = HashMap::new();
    for entry in snapshot.values().flatten() {
        latest
            .entry(entry.user_id.as_str())
            .and_modify(|kept| {
                if entry.last_active > kept.last_active {
                    *kept = entry;
                }
            })
            .or_insert(entry);
    }

    let mut roster: Vec<PresenceEntry> = latest
        .into_values()
        .filter(|entry| now.signed_duration_since(entry.last_active) <= stale_after)
        .cloned()
        .collect();

    roster.sort_by(|a, b| {
        let a_self = a.user_id == self_user_id;
        let b_self = b.user_id == self_user_id;
        b_self
            .cmp(&a_self)
            .then_with(|| {
                a.display_name
                    .to_lowercase()
                    .cmp(&b.display_name.to_lowercase())
            })
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    roster
}

/// Joins presence topics on behalf of one session.
#[derive(Clone)]
pub struct PresenceTracker {
    health: Arc<ConnectionHealthMonitor>,
    clock: SharedClock,
    identity: PresenceIdentity,
    replica: String,
    config: PresenceConfig,
    timeouts: TimeoutConfig,
    refresh: broadcast::Sender<RefreshSignal>,
}

impl PresenceTracker {
    /// `replica` identifies this tab/device among the user's sessions.
    pub fn new(
        health: Arc<ConnectionHealthMonitor>,
        clock: SharedClock,
        identity: PresenceIdentity,
        replica: impl Into<String>,
        config: PresenceConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        let (refresh, _) = broadcast::channel(16);
        Self {
            health,
            clock,
            identity,
            replica: replica.into(),
            config,
            timeouts,
            refresh,
        }
    }

    /// Tell every joined topic that the connection was refreshed.
    pub fn refreshed(&self, signal: &RefreshSignal) {
        // No receivers just means nothing is joined.
        let _ = self.refresh.send(signal.clone());
    }

    /// Start viewing `entity`: publish self, subscribe to the roster, and
    /// start the heartbeat and sweep tasks. Everything stops when the
    /// returned session is dropped.
    pub async fn join(&self, entity: EntityRef) -> Result<PresenceSession> {
        let topic = entity.presence_topic();
        let query_budget = Duration::from_millis(self.timeouts.query_ms);

        let conn = self.health.connection();
        within_budget(
            "presence track",
            query_budget,
            conn.track_presence(&topic, &self.replica, self.identity.entry_at(self.clock.now())),
        )
        .await?;
        let feed = within_budget(
            "presence subscribe",
            query_budget,
            conn.subscribe_presence(&topic),
        )
        .await?;

        let (roster_tx, roster_rx) = watch::channel(Vec::new());
        let refresh = self.refresh.subscribe();
        let cancel = CancellationToken::new();
        let worker = PresenceWorker {
            tracker: self.clone(),
            topic: topic.clone(),
            last_snapshot: RosterSnapshot::new(),
            roster_tx,
        };
        tokio::spawn(worker.run(feed, refresh, cancel.clone()));

        info!(
            entity = %entity,
            user_id = %self.identity.user_id,
            replica = %self.replica,
            "joined presence"
        );
        Ok(PresenceSession {
            entity,
            self_user_id: self.identity.user_id.clone(),
            replica: self.replica.clone(),
            roster: roster_rx,
            _guard: cancel.drop_guard(),
        })
    }
}

struct PresenceWorker {
    tracker: PresenceTracker,
    topic: String,
    last_snapshot: RosterSnapshot,
    roster_tx: watch::Sender<Vec<PresenceEntry>>,
}

impl PresenceWorker {
    async fn run(
        mut self,
        feed: mpsc::UnboundedReceiver<RosterSnapshot>,
        mut refresh: broadcast::Receiver<RefreshSignal>,
        cancel: CancellationToken,
    ) {
        let heartbeat_every = Duration::from_secs(self.tracker.config.heartbeat_interval_secs.max(1));
        let sweep_every = Duration::from_secs(self.tracker.config.sweep_interval_secs.max(1));

        let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed = Some(feed);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(topic = %self.topic, "presence worker stopped");
                    break;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
                _ = sweep.tick() => {
                    if feed.is_none() {
                        feed = self.resubscribe().await;
                    }
                    self.publish_roster();
                }
                run = next_refresh(&mut refresh) => {
                    debug!(topic = %self.topic, run = ?run, "refresh: rejoining presence");
                    self.heartbeat().await;
                    feed = self.resubscribe().await;
                    self.publish_roster();
                }
                snapshot = next_snapshot(&mut feed) => match snapshot {
                    Some(snapshot) => {
                        self.last_snapshot = snapshot;
                        self.publish_roster();
                    }
                    None => {
                        warn!(topic = %self.topic, "presence feed closed; will resubscribe");
                        feed = None;
                    }
                },
            }
        }
    }

    async fn heartbeat(&self) {
        let tracker = &self.tracker;
        let entry = tracker.identity.entry_at(tracker.clock.now());
        let conn = tracker.health.connection();
        let result = within_budget(
            "presence heartbeat",
            Duration::from_millis(tracker.timeouts.query_ms),
            conn.track_presence(&self.topic, &tracker.replica, entry),
        )
        .await;
        if let Err(e) = result {
            warn!(topic = %self.topic, error = %e, "presence heartbeat failed");
        }
    }

    async fn resubscribe(&self) -> Option<mpsc::UnboundedReceiver<RosterSnapshot>> {
        let conn = self.tracker.health.connection();
        match within_budget(
            "presence subscribe",
            Duration::from_millis(self.tracker.timeouts.query_ms),
            conn.subscribe_presence(&self.topic),
        )
        .await
        {
            Ok(feed) => {
                debug!(topic = %self.topic, "presence feed resubscribed");
                Some(feed)
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "presence resubscribe failed");
                None
            }
        }
    }

    fn publish_roster(&self) {
        let tracker = &self.tracker;
        let roster = reconcile_roster(
            &self.last_snapshot,
            &tracker.identity.user_id,
            tracker.clock.now(),
            Duration::from_secs(tracker.config.stale_after_secs),
        );
        self.roster_tx.send_if_modified(|current| {
            if *current == roster {
                return false;
            }
            debug!(
                topic = %self.topic,
                before = current.len(),
                after = roster.len(),
                "presence roster changed"
            );
            *current = roster;
            true
        });
    }
}

/// Run number of the next refresh, `None` when some were skipped.
async fn next_refresh(rx: &mut broadcast::Receiver<RefreshSignal>) -> Option<u64> {
    match rx.recv().await {
        Ok(signal) => Some(signal.run),
        Err(RecvError::Lagged(_)) => None,
        Err(RecvError::Closed) => std::future::pending().await,
    }
}

async fn next_snapshot(
    feed: &mut Option<mpsc::UnboundedReceiver<RosterSnapshot>>,
) -> Option<RosterSnapshot> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// A joined presence topic. Dropping it stops the heartbeat and sweep.
pub struct PresenceSession {
    entity: EntityRef,
    self_user_id: String,
    replica: String,
    roster: watch::Receiver<Vec<PresenceEntry>>,
    _guard: DropGuard,
}

impl PresenceSession {
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Full roster, local user first.
    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.roster.borrow().clone()
    }

    /// Everyone except the local user.
    pub fn others(&self) -> Vec<PresenceEntry> {
        self.roster
            .borrow()
            .iter()
            .filter(|e| e.user_id != self.self_user_id)
            .cloned()
            .collect()
    }

    /// Presence UI is shown only when somebody else is looking.
    pub fn has_other_viewers(&self) -> bool {
        self.roster
            .borrow()
            .iter()
            .any(|e| e.user_id != self.self_user_id)
    }

    /// Watch roster changes.
    pub fn watch(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.roster.clone()
    }

    /// Stop viewing. Equivalent to dropping the session.
    pub fn leave(self) {
        debug!(
            entity = %self.entity,
            user_id = %self.self_user_id,
            replica = %self.replica,
            "leaving presence"
        );
    }
}
