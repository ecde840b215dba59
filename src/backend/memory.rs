//! In-process backend with the same contract as the hosted one.
//!
//! [`MemoryBackend`] plays the server: it assigns ids and timestamps from
//! its own clock, enforces one open timer per owner, fans out change events
//! and presence snapshots, and can be told to misbehave (unreachable,
//! zombie handles, added latency, duplicate delivery). The simulator and
//! the test suite run against it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    ActiveTimerRecord, BackendConnection, BackendError, ChangeEvent, ChangeEventType,
    ChangeFilter, ConnectionFactory, NewTimerRecord, RosterSnapshot,
};
use crate::clock::SharedClock;
use crate::presence::PresenceEntry;

struct Feed {
    generation: u64,
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct PresenceSubscriber {
    generation: u64,
    tx: mpsc::UnboundedSender<RosterSnapshot>,
}

#[derive(Default)]
struct Topic {
    state: RosterSnapshot,
    subscribers: Vec<PresenceSubscriber>,
}

#[derive(Default)]
struct ServerState {
    records: Vec<ActiveTimerRecord>,
    feeds: Vec<Feed>,
    topics: HashMap<String, Topic>,
    unreachable: bool,
    zombie_before: u64,
    latency: Duration,
    duplicate_delivery: bool,
}

impl ServerState {
    fn publish(&mut self, event: ChangeEvent) {
        let copies = if self.duplicate_delivery { 2 } else { 1 };
        let zombie_before = self.zombie_before;
        self.feeds.retain(|feed| {
            if feed.generation < zombie_before || !feed.filter.matches(&event) {
                return !feed.tx.is_closed();
            }
            (0..copies).all(|_| feed.tx.send(event.clone()).is_ok())
        });
    }

    fn publish_roster(&mut self, topic: &str) {
        let zombie_before = self.zombie_before;
        if let Some(topic) = self.topics.get_mut(topic) {
            let snapshot = topic.state.clone();
            topic.subscribers.retain(|sub| {
                if sub.generation < zombie_before {
                    return !sub.tx.is_closed();
                }
                sub.tx.send(snapshot.clone()).is_ok()
            });
        }
    }
}

/// Shared server state. Clones refer to the same server.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<ServerState>>,
    clock: SharedClock,
    generations: Arc<AtomicU64>,
    probes: Arc<AtomicU64>,
}

impl MemoryBackend {
    /// Create a server whose timestamps come from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            clock,
            generations: Arc::new(AtomicU64::new(0)),
            probes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open a new connection handle.
    pub fn connect(&self) -> Arc<dyn BackendConnection> {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(MemoryConnection {
            backend: self.clone(),
            generation,
        })
    }

    /// A factory producing handles to this server.
    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        let backend = self.clone();
        Arc::new(move || backend.connect())
    }

    /// How many handles have been opened so far.
    pub fn connections_built(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    /// How many probes reached the server (including failed ones).
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Make every call fail fast with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Make every handle opened so far hang forever, as after a suspension.
    /// Handles opened afterwards work normally.
    pub fn zombify_connections(&self) {
        let next = self.generations.load(Ordering::SeqCst) + 1;
        self.lock().zombie_before = next;
    }

    /// Delay every call by `latency` before it is applied.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Deliver every change event twice (at-least-once delivery).
    pub fn set_duplicate_delivery(&self, duplicate: bool) {
        self.lock().duplicate_delivery = duplicate;
    }

    /// Push an arbitrary event to matching change feeds.
    pub fn emit(&self, event: ChangeEvent) {
        self.lock().publish(event);
    }

    /// All records, open and closed.
    pub fn records(&self) -> Vec<ActiveTimerRecord> {
        self.lock().records.clone()
    }

    /// Number of open timers for `owner_id`.
    pub fn open_count(&self, owner_id: &str) -> usize {
        self.lock()
            .records
            .iter()
            .filter(|r| r.owner_id == owner_id && r.is_open())
            .count()
    }

    /// Close a timer as another device would, bypassing any client.
    pub fn close_directly(&self, id: Uuid) -> Option<ActiveTimerRecord> {
        self.close_open(id)
    }

    /// Stamp `end_time` from the server clock and derive the duration.
    fn close_open(&self, id: Uuid) -> Option<ActiveTimerRecord> {
        let now = self.clock.now();
        let mut state = self.lock();
        let record = state.records.iter_mut().find(|r| r.id == id && r.is_open())?;
        let old = record.clone();
        record.end_time = Some(now);
        record.duration_secs = Some((now - record.start_time).num_seconds().max(0));
        let new = record.clone();
        state.publish(ChangeEvent {
            event_type: ChangeEventType::Update,
            old: Some(old),
            new: Some(new.clone()),
        });
        Some(new)
    }

    /// Publish a presence payload for `replica` as another client would.
    pub fn track_directly(&self, topic: &str, replica: &str, entry: PresenceEntry) {
        let mut state = self.lock();
        state
            .topics
            .entry(topic.to_owned())
            .or_default()
            .state
            .insert(replica.to_owned(), vec![entry]);
        state.publish_roster(topic);
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }
}

struct MemoryConnection {
    backend: MemoryBackend,
    generation: u64,
}

impl MemoryConnection {
    /// Apply fault injection before touching server state.
    async fn gate(&self) -> Result<(), BackendError> {
        let (unreachable, zombie, latency) = {
            let state = self.backend.lock();
            (
                state.unreachable,
                self.generation < state.zombie_before,
                state.latency,
            )
        };
        if zombie {
            std::future::pending::<()>().await;
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if unreachable {
            return Err(BackendError::Transport("backend unreachable".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn probe(&self) -> Result<(), BackendError> {
        self.backend.probes.fetch_add(1, Ordering::SeqCst);
        self.gate().await
    }

    async fn open_timer(&self, owner_id: &str) -> Result<Option<ActiveTimerRecord>, BackendError> {
        self.gate().await?;
        Ok(self
            .backend
            .lock()
            .records
            .iter()
            .find(|r| r.owner_id == owner_id && r.is_open())
            .cloned())
    }

    async fn insert_timer(&self, new: NewTimerRecord) -> Result<ActiveTimerRecord, BackendError> {
        self.gate().await?;
        let now = self.backend.clock.now();
        let mut state = self.backend.lock();
        if state
            .records
            .iter()
            .any(|r| r.owner_id == new.owner_id && r.is_open())
        {
            debug!(owner_id = %new.owner_id, "rejecting insert: open timer exists");
            return Err(BackendError::UniqueViolation {
                owner_id: new.owner_id,
            });
        }

        let record = ActiveTimerRecord {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            entity_type: new.entity.entity_type,
            entity_id: new.entity.entity_id,
            start_time: now,
            end_time: None,
            duration_secs: None,
            timezone: new.timezone,
        };
        state.records.push(record.clone());
        state.publish(ChangeEvent {
            event_type: ChangeEventType::Insert,
            old: None,
            new: Some(record.clone()),
        });
        Ok(record)
    }

    async fn close_timer(&self, id: Uuid) -> Result<ActiveTimerRecord, BackendError> {
        self.gate().await?;
        self.backend
            .close_open(id)
            .ok_or(BackendError::NotFound { id })
    }

    async fn subscribe_changes(
        &self,
        filter: ChangeFilter,
    ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>, BackendError> {
        self.gate().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.backend.lock().feeds.push(Feed {
            generation: self.generation,
            filter,
            tx,
        });
        Ok(rx)
    }

    async fn track_presence(
        &self,
        topic: &str,
        replica: &str,
        entry: PresenceEntry,
    ) -> Result<(), BackendError> {
        self.gate().await?;
        self.backend.track_directly(topic, replica, entry);
        Ok(())
    }

    async fn subscribe_presence(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<RosterSnapshot>, BackendError> {
        self.gate().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.backend.lock();
        let topic = state.topics.entry(topic.to_owned()).or_default();
        // New subscribers start from the current roster.
        let _ = tx.send(topic.state.clone());
        topic.subscribers.push(PresenceSubscriber {
            generation: self.generation,
            tx,
        });
        Ok(rx)
    }
}
