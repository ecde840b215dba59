//! Single active timer per owner.
//!
//! Exclusivity is a two-layer protocol. [`TimerExclusivityCoordinator::start`]
//! first checks local state and the cached snapshot, which rejects the
//! common double-click case without a round trip. The backend's uniqueness
//! constraint on open records is what actually guarantees the invariant: when
//! two sessions both pass the local check, exactly one insert wins and the
//! other is turned into [`SyncError::AlreadyRunning`] followed by a
//! reconciliation onto the winner's record.
//!
//! Every state write carries a sequence number. A reconciliation read that
//! was issued before a newer write landed is discarded when it returns, so
//! late responses can never roll the display back.
//!
//! Durations are computed from the server clock only. The local clock feeds
//! the one-second display tick and nothing else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::backend::{ActiveTimerRecord, BackendError, ChangeEvent, EntityRef, NewTimerRecord};
use crate::broadcast::{BroadcastChannel, TimerBroadcast};
use crate::clock::SharedClock;
use crate::config::{TimeoutConfig, TimerConfig};
use crate::error::{Result, SyncError};
use crate::health::{ConnectionHealthMonitor, within_budget};
use crate::storage::{LocalTimerCache, LocalTimerSnapshot};

/// Render whole seconds as `m:ss`, or `h:mm:ss` from one hour up.
pub fn format_elapsed(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[derive(Debug, Default)]
struct TimerState {
    active: Option<LocalTimerSnapshot>,
    applied_seq: u64,
}

/// Enforces one running timer per owner and drives the live elapsed display.
pub struct TimerExclusivityCoordinator {
    owner_id: String,
    health: Arc<ConnectionHealthMonitor>,
    cache: LocalTimerCache,
    broadcast: BroadcastChannel,
    clock: SharedClock,
    config: TimerConfig,
    timeouts: TimeoutConfig,
    state: Mutex<TimerState>,
    seq: AtomicU64,
    running_tx: watch::Sender<Option<LocalTimerSnapshot>>,
    elapsed_tx: watch::Sender<u64>,
    ticker: Mutex<Option<DropGuard>>,
    me: Weak<Self>,
}

impl TimerExclusivityCoordinator {
    pub fn new(
        owner_id: impl Into<String>,
        health: Arc<ConnectionHealthMonitor>,
        cache: LocalTimerCache,
        broadcast: BroadcastChannel,
        clock: SharedClock,
        config: TimerConfig,
        timeouts: TimeoutConfig,
    ) -> Arc<Self> {
        let owner_id = owner_id.into();
        Arc::new_cyclic(|me| Self {
            owner_id,
            health,
            cache,
            broadcast,
            clock,
            config,
            timeouts,
            state: Mutex::new(TimerState::default()),
            seq: AtomicU64::new(0),
            running_tx: watch::channel(None).0,
            elapsed_tx: watch::channel(0).0,
            ticker: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Start a timer on `entity_type`/`entity_id` labelled `label`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Validation`] for blank identifiers or an oversized
    /// label, [`SyncError::AlreadyRunning`] when a timer is already open
    /// (locally or on the backend), and connection-class errors when the
    /// insert could not be completed.
    pub async fn start(
        &self,
        entity_type: &str,
        entity_id: &str,
        label: &str,
    ) -> Result<LocalTimerSnapshot> {
        self.validate(entity_type, entity_id, label)?;

        if self.active().is_some() || self.cache.get().is_some() {
            debug!(owner_id = %self.owner_id, "start rejected by local pre-check");
            return Err(SyncError::AlreadyRunning);
        }

        let entity = EntityRef::new(entity_type.trim(), entity_id.trim());
        let insert = NewTimerRecord {
            owner_id: self.owner_id.clone(),
            entity: entity.clone(),
            timezone: self.config.timezone.clone(),
        };
        let conn = self.health.connection();
        let outcome = within_budget(
            "timer start",
            self.mutation_budget(),
            conn.insert_timer(insert),
        )
        .await;

        let record = match outcome {
            Ok(record) => record,
            Err(SyncError::Backend(BackendError::UniqueViolation { .. })) => {
                info!(
                    owner_id = %self.owner_id,
                    entity = %entity,
                    "backend rejected concurrent start; reconciling"
                );
                if let Err(e) = self.reconcile().await {
                    warn!(owner_id = %self.owner_id, error = %e, "reconcile after rejected start failed");
                }
                return Err(SyncError::AlreadyRunning);
            }
            Err(e) => return Err(e),
        };

        let snapshot = LocalTimerSnapshot::from_record(&record, label.trim());
        self.apply(self.next_seq(), Some(snapshot.clone()));
        self.broadcast.broadcast(TimerBroadcast::Started {
            snapshot: snapshot.clone(),
        });
        info!(
            owner_id = %self.owner_id,
            entry_id = %record.id,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            "timer started"
        );
        Ok(snapshot)
    }

    /// Stop the running timer. The backend stamps the end time when the
    /// write lands and derives the duration from its own clock.
    ///
    /// # Errors
    ///
    /// [`SyncError::NoActiveTimer`] when nothing is running (locally, or on
    /// the backend after reconciliation), and connection-class errors when
    /// the backend could not be reached.
    pub async fn stop(&self) -> Result<ActiveTimerRecord> {
        let Some(active) = self.active().or_else(|| self.cache.get()) else {
            return Err(SyncError::NoActiveTimer);
        };

        let conn = self.health.connection();
        let outcome = within_budget(
            "timer stop",
            self.mutation_budget(),
            conn.close_timer(active.entry_id),
        )
        .await;

        let record = match outcome {
            Ok(record) => record,
            Err(SyncError::Backend(BackendError::NotFound { id })) => {
                info!(owner_id = %self.owner_id, entry_id = %id, "timer already closed elsewhere; reconciling");
                if let Err(e) = self.reconcile().await {
                    warn!(owner_id = %self.owner_id, error = %e, "reconcile after failed stop failed");
                }
                return Err(SyncError::NoActiveTimer);
            }
            Err(e) => return Err(e),
        };

        self.apply(self.next_seq(), None);
        self.broadcast.broadcast(TimerBroadcast::Stopped {
            entry_id: record.id,
        });
        info!(
            owner_id = %self.owner_id,
            entry_id = %record.id,
            duration_secs = record.duration_secs,
            "timer stopped"
        );
        Ok(record)
    }

    /// Recompute the display-only elapsed seconds from the local clock.
    pub fn tick(&self) -> u64 {
        let elapsed = self
            .active()
            .map(|active| {
                let secs = self
                    .clock
                    .now()
                    .signed_duration_since(active.start_time)
                    .num_seconds();
                u64::try_from(secs).unwrap_or(0)
            })
            .unwrap_or(0);
        self.elapsed_tx.send_if_modified(|current| {
            let changed = *current != elapsed;
            *current = elapsed;
            changed
        });
        elapsed
    }

    /// Re-derive local state from the authoritative open record.
    ///
    /// Safe to call any number of times. Returns the open record, if any.
    pub async fn reconcile(&self) -> Result<Option<ActiveTimerRecord>> {
        let seq = self.next_seq();
        let conn = self.health.connection();
        let record = within_budget(
            "timer reconcile",
            self.query_budget(),
            conn.open_timer(&self.owner_id),
        )
        .await?;

        let next = record
            .as_ref()
            .map(|record| LocalTimerSnapshot::from_record(record, self.label_for(record)));
        if self.apply(seq, next) {
            debug!(
                owner_id = %self.owner_id,
                seq,
                running = record.is_some(),
                "timer reconciled"
            );
        }
        Ok(record)
    }

    /// React to a change-feed notification for this owner.
    ///
    /// The event only says that something changed; truth is re-read from
    /// the backend, which makes duplicate and out-of-order delivery harmless.
    pub async fn handle_change(&self, event: &ChangeEvent) -> Result<()> {
        let Some(record) = event.record() else {
            return Ok(());
        };
        if record.owner_id != self.owner_id {
            return Ok(());
        }
        debug!(
            owner_id = %self.owner_id,
            entry_id = %record.id,
            event = ?event.event_type,
            "timer change received"
        );
        self.reconcile().await.map(|_| ())
    }

    /// Apply a sibling session's broadcast without a network round trip.
    pub fn adopt_broadcast(&self, message: TimerBroadcast) {
        match message {
            TimerBroadcast::Started { snapshot } => {
                debug!(owner_id = %self.owner_id, entry_id = %snapshot.entry_id, "adopting sibling timer");
                self.apply(self.next_seq(), Some(snapshot));
            }
            TimerBroadcast::Stopped { entry_id } => {
                let matches = self
                    .active()
                    .is_some_and(|active| active.entry_id == entry_id);
                if matches {
                    debug!(owner_id = %self.owner_id, %entry_id, "sibling stopped timer");
                    self.apply(self.next_seq(), None);
                }
            }
        }
    }

    /// Show the cached snapshot immediately, before the backend answers.
    pub fn restore_from_cache(&self) -> Option<LocalTimerSnapshot> {
        let snapshot = self.cache.get()?;
        debug!(owner_id = %self.owner_id, entry_id = %snapshot.entry_id, "restored cached timer");
        self.apply(self.next_seq(), Some(snapshot.clone()));
        Some(snapshot)
    }

    pub fn active(&self) -> Option<LocalTimerSnapshot> {
        self.lock_state().active.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().active.is_some()
    }

    /// Last computed display value.
    pub fn elapsed_seconds(&self) -> u64 {
        *self.elapsed_tx.borrow()
    }

    pub fn watch_running(&self) -> watch::Receiver<Option<LocalTimerSnapshot>> {
        self.running_tx.subscribe()
    }

    pub fn watch_elapsed(&self) -> watch::Receiver<u64> {
        self.elapsed_tx.subscribe()
    }

    fn validate(&self, entity_type: &str, entity_id: &str, label: &str) -> Result<()> {
        if entity_type.trim().is_empty() {
            return Err(SyncError::Validation("entity type must not be empty".into()));
        }
        if entity_id.trim().is_empty() {
            return Err(SyncError::Validation("entity id must not be empty".into()));
        }
        if label.trim().is_empty() {
            return Err(SyncError::Validation("timer label must not be empty".into()));
        }
        let len = label.trim().chars().count();
        if len > self.config.max_label_len {
            return Err(SyncError::Validation(format!(
                "timer label is {len} characters, limit is {}",
                self.config.max_label_len
            )));
        }
        Ok(())
    }

    /// Keep the label we already know for a record; the backend does not
    /// store it.
    fn label_for(&self, record: &ActiveTimerRecord) -> String {
        if let Some(active) = self.active().filter(|a| a.entry_id == record.id) {
            return active.display_name;
        }
        if let Some(cached) = self.cache.get().filter(|c| c.entry_id == record.id) {
            return cached.display_name;
        }
        record.entity().to_string()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Install `next` as the active timer unless a newer write already
    /// landed. Returns whether the write was applied.
    fn apply(&self, seq: u64, next: Option<LocalTimerSnapshot>) -> bool {
        let changed = {
            let mut state = self.lock_state();
            if seq < state.applied_seq {
                debug!(
                    owner_id = %self.owner_id,
                    seq,
                    applied = state.applied_seq,
                    "discarding superseded timer state"
                );
                return false;
            }
            state.applied_seq = seq;
            let changed = state.active != next;
            state.active = next.clone();
            changed
        };

        match &next {
            Some(snapshot) => self.cache.set(snapshot),
            None => self.cache.clear(),
        }
        if changed {
            self.set_ticking(next.is_some());
            self.running_tx.send_replace(next);
        }
        self.tick();
        true
    }

    fn set_ticking(&self, running: bool) {
        let mut ticker = match self.ticker.lock() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        if !running {
            // Dropping the guard cancels the task.
            *ticker = None;
            return;
        }
        if ticker.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(owner_id = %self.owner_id, "no async runtime; elapsed display will not tick");
            return;
        };
        let cancel = CancellationToken::new();
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));
        runtime.spawn(run_ticker(self.me.clone(), period, cancel.clone()));
        *ticker = Some(cancel.drop_guard());
    }

    fn query_budget(&self) -> Duration {
        Duration::from_millis(self.timeouts.query_ms)
    }

    fn mutation_budget(&self) -> Duration {
        Duration::from_millis(self.timeouts.mutation_ms)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TimerState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        }
    }
}

async fn run_ticker(
    coordinator: Weak<TimerExclusivityCoordinator>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.tick();
            }
        }
    }
}
