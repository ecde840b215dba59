//! Post-dormancy recovery.
//!
//! [`RecoveryOrchestrator`] sequences health check, auth refresh and data
//! refresh after the client comes back from the background, or when a
//! caller asks for it after a network-class write failure.
//!
//! # States
//!
//! | Status | Meaning | Writes |
//! |--------|---------|--------|
//! | [`Idle`](RecoveryStatus::Idle) | no run yet | direct |
//! | [`Recovering`](RecoveryStatus::Recovering) | run in progress | queued |
//! | [`Healthy`](RecoveryStatus::Healthy) | last run completed | direct |
//! | [`Degraded`](RecoveryStatus::Degraded) | last run hit a bad connection | queued |
//!
//! Runs are single-flight: a trigger that arrives while a run is in progress
//! is dropped. Visibility events are debounced, and a hidden period shorter
//! than the configured minimum never starts a run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::{RecoveryConfig, TimeoutConfig};
use crate::error::{Result, SyncError};
use crate::health::{ConnectionHealthMonitor, millis};
use crate::listeners::{ListenerRegistry, Subscription};

/// Where the orchestrator is in its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Idle,
    Recovering,
    Healthy,
    Degraded,
}

impl RecoveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recovering => "recovering",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How sure the client is that its session credentials are still valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthConfidence {
    /// The auth service confirmed the session.
    Confirmed,
    /// Relying on a locally held session that was not re-checked.
    Cached,
    /// Refresh failed on every attempt.
    Unknown,
}

/// Observable recovery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub status: RecoveryStatus,
    pub last_recovery_at: Option<DateTime<Utc>>,
    pub connection_healthy: bool,
    pub auth_confidence: AuthConfidence,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self {
            status: RecoveryStatus::Idle,
            last_recovery_at: None,
            connection_healthy: true,
            auth_confidence: AuthConfidence::Cached,
        }
    }
}

/// Whether a write should be deferred to the mutation queue instead of
/// executed now.
pub fn should_queue_mutation(status: RecoveryStatus) -> bool {
    matches!(status, RecoveryStatus::Degraded | RecoveryStatus::Recovering)
}

/// Session credential refresh, provided by the host application.
#[async_trait]
pub trait AuthRefresher: Send + Sync {
    /// Refresh the session. An error lowers confidence; it never signs the
    /// user out by itself.
    async fn refresh(&self) -> Result<AuthConfidence>;
}

/// Refresher for hosts without a refreshable session. Keeps whatever the
/// client already holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedAuth;

#[async_trait]
impl AuthRefresher for CachedAuth {
    async fn refresh(&self) -> Result<AuthConfidence> {
        Ok(AuthConfidence::Cached)
    }
}

/// Page visibility as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Hidden,
    Visible,
}

/// What started a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    /// The client came back after being hidden for this long.
    Dormancy(Duration),
    /// A caller asked for it.
    Manual,
}

/// Fanned out to refresh subscribers after a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSignal {
    /// 1-based run counter.
    pub run: u64,
    pub at: DateTime<Utc>,
    pub auth_confidence: AuthConfidence,
}

#[derive(Default)]
struct Dormancy {
    hidden_since: Option<Instant>,
    /// Longest hidden period seen since the last debounce fired.
    pending: Option<Duration>,
    debounce: Option<AbortHandle>,
}

/// Resets the in-flight flag however the run ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives the `idle -> recovering -> healthy | degraded` state machine.
pub struct RecoveryOrchestrator {
    health: Arc<ConnectionHealthMonitor>,
    auth: Arc<dyn AuthRefresher>,
    clock: SharedClock,
    config: RecoveryConfig,
    auth_budget: Duration,
    in_flight: AtomicBool,
    runs: AtomicU64,
    state_tx: watch::Sender<RecoveryState>,
    refresh: ListenerRegistry<RefreshSignal>,
    dormancy: Mutex<Dormancy>,
    me: Weak<Self>,
}

impl RecoveryOrchestrator {
    pub fn new(
        health: Arc<ConnectionHealthMonitor>,
        auth: Arc<dyn AuthRefresher>,
        clock: SharedClock,
        config: RecoveryConfig,
        timeouts: &TimeoutConfig,
    ) -> Arc<Self> {
        let auth_budget = Duration::from_millis(timeouts.query_ms);
        Arc::new_cyclic(|me| Self {
            health,
            auth,
            clock,
            config,
            auth_budget,
            in_flight: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            state_tx: watch::channel(RecoveryState::default()).0,
            refresh: ListenerRegistry::new("recovery-refresh"),
            dormancy: Mutex::new(Dormancy::default()),
            me: me.clone(),
        })
    }

    pub fn state(&self) -> RecoveryState {
        self.state_tx.borrow().clone()
    }

    pub fn status(&self) -> RecoveryStatus {
        self.state_tx.borrow().status
    }

    pub fn is_degraded(&self) -> bool {
        self.status() == RecoveryStatus::Degraded
    }

    pub fn watch(&self) -> watch::Receiver<RecoveryState> {
        self.state_tx.subscribe()
    }

    /// Number of runs started so far.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Called after every successful run. Each callback is isolated from the
    /// others.
    pub fn subscribe_to_refresh(
        &self,
        listener: impl Fn(&RefreshSignal) + Send + Sync + 'static,
    ) -> Subscription {
        self.refresh.subscribe(listener)
    }

    /// Run the recovery sequence now, unless one is already running.
    pub async fn request_recovery(&self) -> RecoveryStatus {
        self.run_recovery(RecoveryTrigger::Manual).await
    }

    /// Run the recovery sequence. Never fails: every problem ends up as
    /// [`RecoveryStatus::Degraded`]. Returns the status after the run, or
    /// the current status when the trigger was dropped.
    pub async fn run_recovery(&self, trigger: RecoveryTrigger) -> RecoveryStatus {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!(?trigger, "recovery already in progress; trigger ignored");
            return self.status();
        }
        let _in_flight = InFlight(&self.in_flight);
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;

        info!(run, ?trigger, "recovery started");
        self.update(|s| s.status = RecoveryStatus::Recovering);

        let outcome = AssertUnwindSafe(self.sequence(run)).catch_unwind().await;
        let status = match outcome {
            Ok(Ok(())) => RecoveryStatus::Healthy,
            Ok(Err(e)) => {
                warn!(run, error = %e, "recovery degraded");
                RecoveryStatus::Degraded
            }
            Err(_) => {
                warn!(run, "recovery step panicked; degrading");
                RecoveryStatus::Degraded
            }
        };

        self.update(|s| s.status = status);
        info!(run, status = %status, "recovery finished");
        status
    }

    async fn sequence(&self, run: u64) -> Result<()> {
        let healthy = self.health.check_health_with_reset().await;
        self.update(|s| s.connection_healthy = healthy);
        if !healthy {
            return Err(SyncError::ConnectionUnhealthy(
                "probe failed after connection rebuild".to_owned(),
            ));
        }

        let auth_confidence = self.refresh_auth(run).await;
        self.update(|s| s.auth_confidence = auth_confidence);

        let at = self.clock.now();
        let signal = RefreshSignal {
            run,
            at,
            auth_confidence,
        };
        let failed = self.refresh.notify(&signal);
        if failed > 0 {
            warn!(run, failed, "refresh subscribers failed");
        }
        self.update(|s| s.last_recovery_at = Some(at));
        Ok(())
    }

    async fn refresh_auth(&self, run: u64) -> AuthConfidence {
        let attempts = self.config.auth_retry_attempts.max(1);
        for attempt in 1..=attempts {
            let outcome = tokio::time::timeout(self.auth_budget, self.auth.refresh()).await;
            match outcome {
                Ok(Ok(confidence)) => {
                    debug!(run, attempt, ?confidence, "auth refreshed");
                    return confidence;
                }
                Ok(Err(e)) => warn!(run, attempt, error = %e, "auth refresh failed"),
                Err(_) => warn!(run, attempt, "auth refresh timed out"),
            }
        }
        warn!(run, attempts, "auth refresh exhausted; confidence unknown");
        AuthConfidence::Unknown
    }

    /// Feed a host visibility transition.
    ///
    /// `Hidden` starts (or keeps) the dormancy clock and cancels a pending
    /// debounce. `Visible` records how long the client was hidden and
    /// (re)arms the debounce; when it fires, recovery runs if the longest
    /// hidden period in the burst reached the minimum.
    pub fn on_visibility_change(&self, visibility: Visibility) {
        let mut dormancy = self.lock_dormancy();
        match visibility {
            Visibility::Hidden => {
                if let Some(debounce) = dormancy.debounce.take() {
                    debounce.abort();
                }
                if dormancy.hidden_since.is_none() {
                    dormancy.hidden_since = Some(Instant::now());
                }
            }
            Visibility::Visible => {
                let Some(since) = dormancy.hidden_since.take() else {
                    return;
                };
                let hidden = since.elapsed();
                debug!(hidden_ms = millis(hidden), "client visible");
                dormancy.pending = Some(dormancy.pending.map_or(hidden, |p| p.max(hidden)));

                if let Some(debounce) = dormancy.debounce.take() {
                    debounce.abort();
                }
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!("no async runtime; dormancy recovery disabled");
                    return;
                };
                let me = self.me.clone();
                let delay = Duration::from_millis(self.config.debounce_ms);
                let task = runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(me) = me.upgrade() {
                        me.fire_debounced().await;
                    }
                });
                dormancy.debounce = Some(task.abort_handle());
            }
        }
    }

    async fn fire_debounced(&self) {
        let hidden = {
            let mut dormancy = self.lock_dormancy();
            dormancy.debounce = None;
            dormancy.pending.take()
        };
        let Some(hidden) = hidden else {
            return;
        };
        let minimum = Duration::from_millis(self.config.min_dormancy_ms);
        if hidden < minimum {
            debug!(
                hidden_ms = millis(hidden),
                "short dormancy; recovery skipped"
            );
            return;
        }
        self.run_recovery(RecoveryTrigger::Dormancy(hidden)).await;
    }

    fn update(&self, f: impl FnOnce(&mut RecoveryState)) {
        self.state_tx.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    fn lock_dormancy(&self) -> std::sync::MutexGuard<'_, Dormancy> {
        match self.dormancy.lock() {
            Ok(d) => d,
            Err(p) => p.into_inner(),
        }
    }
}
