//! Application-scoped client session.
//!
//! [`ClientSession`] owns one backend connection handle (through the health
//! monitor), the timer coordinator, the recovery orchestrator and the
//! background tasks that connect them:
//!
//! - sibling broadcasts are applied to the timer without a round trip;
//! - the owner's change feed drives timer reconciliation;
//! - every recovery refresh re-subscribes the feed on the current
//!   connection and reconciles the timer;
//! - the same refresh rejoins every presence topic the session is viewing.
//!
//! Dropping the session stops all of it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{ActiveTimerRecord, ChangeEvent, ChangeFilter, ConnectionFactory, EntityRef};
use crate::broadcast::{BroadcastChannel, BroadcastHub};
use crate::clock::{SharedClock, SystemClock};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::health::{ConnectionHealthMonitor, within_budget};
use crate::listeners::Subscription;
use crate::presence::{PresenceIdentity, PresenceSession, PresenceTracker};
use crate::recovery::{
    AuthRefresher, CachedAuth, RecoveryOrchestrator, RecoveryState, RecoveryStatus, RefreshSignal,
    Visibility,
};
use crate::storage::{FileSnapshotStore, LocalTimerCache, LocalTimerSnapshot, SnapshotStore};
use crate::timer::{TimerExclusivityCoordinator, format_elapsed};

/// Builder for [`ClientSession`].
pub struct ClientSessionBuilder {
    identity: PresenceIdentity,
    factory: Arc<dyn ConnectionFactory>,
    config: SyncConfig,
    clock: SharedClock,
    store: Option<Arc<dyn SnapshotStore>>,
    hub: Option<Arc<BroadcastHub>>,
    auth: Arc<dyn AuthRefresher>,
    replica: Option<String>,
}

impl ClientSessionBuilder {
    pub fn new(identity: PresenceIdentity, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            identity,
            factory,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            store: None,
            hub: None,
            auth: Arc::new(CachedAuth),
            replica: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for display ticks and presence stamps.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Snapshot storage. Defaults to a file store under the configured
    /// storage directory.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Hub shared with sibling sessions. Without one, broadcast is a no-op.
    pub fn broadcast_hub(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn auth_refresher(mut self, auth: Arc<dyn AuthRefresher>) -> Self {
        self.auth = auth;
        self
    }

    /// Replica key used on presence topics. Defaults to a random id.
    pub fn replica(mut self, replica: impl Into<String>) -> Self {
        self.replica = Some(replica.into());
        self
    }

    /// Build the session, show any cached timer, reconcile it against the
    /// backend and start the background tasks.
    ///
    /// Backend failures during start-up are logged, not returned; the
    /// session comes up with whatever the cache says and catches up on the
    /// next refresh.
    pub async fn build(self) -> ClientSession {
        let config = self.config;
        let owner_id = self.identity.user_id.clone();
        let replica = self.replica.unwrap_or_else(|| Uuid::new_v4().to_string());

        let health = Arc::new(ConnectionHealthMonitor::new(self.factory, &config.health));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FileSnapshotStore::new(config.storage.effective_dir())));
        let cache = LocalTimerCache::new(store, config.storage.snapshot_key.clone());
        let channel = match &self.hub {
            Some(hub) => hub.open(&config.broadcast.channel),
            None => BroadcastChannel::unavailable(&config.broadcast.channel),
        };

        let timer = TimerExclusivityCoordinator::new(
            owner_id.clone(),
            Arc::clone(&health),
            cache,
            channel.clone(),
            Arc::clone(&self.clock),
            config.timer.clone(),
            config.timeouts.clone(),
        );
        let recovery = RecoveryOrchestrator::new(
            Arc::clone(&health),
            self.auth,
            Arc::clone(&self.clock),
            config.recovery.clone(),
            &config.timeouts,
        );
        let presence = PresenceTracker::new(
            Arc::clone(&health),
            Arc::clone(&self.clock),
            self.identity.clone(),
            replica.clone(),
            config.presence.clone(),
            config.timeouts.clone(),
        );

        let broadcast_sub = {
            let timer = Arc::downgrade(&timer);
            channel.subscribe(move |message| {
                if let Some(timer) = timer.upgrade() {
                    timer.adopt_broadcast(message);
                }
            })
        };

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let refresh_sub = {
            let presence = presence.clone();
            recovery.subscribe_to_refresh(move |signal| {
                presence.refreshed(signal);
                let _ = refresh_tx.send(signal.clone());
            })
        };

        timer.restore_from_cache();
        if let Err(e) = timer.reconcile().await {
            warn!(owner_id = %owner_id, error = %e, "initial timer reconcile failed");
        }

        let pump = ChangePump {
            timer: Arc::clone(&timer),
            health: Arc::clone(&health),
            filter: ChangeFilter::owner(owner_id.clone()),
            query_budget: Duration::from_millis(config.timeouts.query_ms),
        };
        let feed = pump.subscribe().await;
        let cancel = CancellationToken::new();
        tokio::spawn(pump.run(feed, refresh_rx, cancel.clone()));

        info!(owner_id = %owner_id, replica = %replica, "client session started");
        ClientSession {
            identity: self.identity,
            health,
            timer,
            recovery,
            presence,
            _broadcast_sub: broadcast_sub,
            _refresh_sub: refresh_sub,
            _tasks: cancel.drop_guard(),
        }
    }
}

/// Forwards change-feed events to the timer and re-subscribes after every
/// recovery refresh.
struct ChangePump {
    timer: Arc<TimerExclusivityCoordinator>,
    health: Arc<ConnectionHealthMonitor>,
    filter: ChangeFilter,
    query_budget: Duration,
}

impl ChangePump {
    async fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<ChangeEvent>> {
        let conn = self.health.connection();
        match within_budget(
            "change feed subscribe",
            self.query_budget,
            conn.subscribe_changes(self.filter.clone()),
        )
        .await
        {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!(owner_id = %self.filter.owner_id, error = %e, "change feed subscribe failed");
                None
            }
        }
    }

    async fn run(
        self,
        mut feed: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
        mut refresh: mpsc::UnboundedReceiver<RefreshSignal>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = refresh.recv() => {
                    let Some(signal) = signal else { break };
                    debug!(run = signal.run, "refresh: resubscribing change feed");
                    feed = self.subscribe().await;
                    if let Err(e) = self.timer.reconcile().await {
                        warn!(run = signal.run, error = %e, "reconcile after refresh failed");
                    }
                }
                event = next_event(&mut feed) => match event {
                    Some(event) => {
                        if let Err(e) = self.timer.handle_change(&event).await {
                            warn!(error = %e, "reconcile after change event failed");
                        }
                    }
                    None => {
                        warn!(owner_id = %self.filter.owner_id, "change feed closed; waiting for refresh");
                        feed = None;
                    }
                },
            }
        }
        debug!(owner_id = %self.filter.owner_id, "change pump stopped");
    }
}

async fn next_event(feed: &mut Option<mpsc::UnboundedReceiver<ChangeEvent>>) -> Option<ChangeEvent> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// One client process (tab or device) of one user.
pub struct ClientSession {
    identity: PresenceIdentity,
    health: Arc<ConnectionHealthMonitor>,
    timer: Arc<TimerExclusivityCoordinator>,
    recovery: Arc<RecoveryOrchestrator>,
    presence: PresenceTracker,
    _broadcast_sub: Subscription,
    _refresh_sub: Subscription,
    _tasks: DropGuard,
}

impl ClientSession {
    pub fn builder(
        identity: PresenceIdentity,
        factory: Arc<dyn ConnectionFactory>,
    ) -> ClientSessionBuilder {
        ClientSessionBuilder::new(identity, factory)
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Start a timer. A connection-class failure also requests recovery in
    /// the background.
    pub async fn start(
        &self,
        entity_type: &str,
        entity_id: &str,
        label: &str,
    ) -> Result<LocalTimerSnapshot> {
        let result = self.timer.start(entity_type, entity_id, label).await;
        if let Err(e) = &result {
            self.after_write_failure(e);
        }
        result
    }

    /// Stop the running timer.
    pub async fn stop(&self) -> Result<ActiveTimerRecord> {
        let result = self.timer.stop().await;
        if let Err(e) = &result {
            self.after_write_failure(e);
        }
        result
    }

    /// Live display value, recomputed every tick.
    pub fn elapsed_seconds(&self) -> u64 {
        self.timer.elapsed_seconds()
    }

    /// [`elapsed_seconds`](Self::elapsed_seconds) as `m:ss` / `h:mm:ss`.
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed_seconds())
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub fn active_timer(&self) -> Option<LocalTimerSnapshot> {
        self.timer.active()
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.recovery.status()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn is_degraded(&self) -> bool {
        self.recovery.is_degraded()
    }

    /// Whether writes should go through the mutation queue right now.
    pub fn should_queue_mutation(&self) -> bool {
        crate::recovery::should_queue_mutation(self.recovery.status())
    }

    pub fn subscribe_to_refresh(
        &self,
        listener: impl Fn(&RefreshSignal) + Send + Sync + 'static,
    ) -> Subscription {
        self.recovery.subscribe_to_refresh(listener)
    }

    pub async fn request_recovery(&self) -> RecoveryStatus {
        self.recovery.request_recovery().await
    }

    pub fn on_visibility_change(&self, visibility: Visibility) {
        self.recovery.on_visibility_change(visibility);
    }

    /// Start viewing `entity` on the presence channel.
    pub async fn join_presence(&self, entity: EntityRef) -> Result<PresenceSession> {
        self.presence.join(entity).await
    }

    pub fn is_connection_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn watch_running(&self) -> watch::Receiver<Option<LocalTimerSnapshot>> {
        self.timer.watch_running()
    }

    pub fn watch_elapsed(&self) -> watch::Receiver<u64> {
        self.timer.watch_elapsed()
    }

    pub fn watch_recovery(&self) -> watch::Receiver<RecoveryState> {
        self.recovery.watch()
    }

    pub fn watch_health(&self) -> watch::Receiver<bool> {
        self.health.watch()
    }

    pub fn timer(&self) -> &Arc<TimerExclusivityCoordinator> {
        &self.timer
    }

    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.recovery
    }

    fn after_write_failure(&self, error: &crate::error::SyncError) {
        if !error.is_connection_class() {
            return;
        }
        self.health.mark_unhealthy();
        let recovery = Arc::clone(&self.recovery);
        tokio::spawn(async move {
            recovery.request_recovery().await;
        });
    }
}
