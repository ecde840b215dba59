//! Connection liveness probing and connection rebuild.
//!
//! [`ConnectionHealthMonitor`] owns the application's backend connection
//! handle. The handle is built lazily on first use and replaced only through
//! [`reset_connection`](ConnectionHealthMonitor::reset_connection), never
//! swapped from the outside.
//!
//! Long-lived handles can stop answering after the client process resumes
//! from suspension without ever reporting an error. The two-phase
//! [`check_health_with_reset`](ConnectionHealthMonitor::check_health_with_reset)
//! probes, rebuilds the handle from scratch on failure, and probes exactly
//! once more.
//!
//! Health is a single boolean. Listeners are notified only when it flips.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, BackendError, ConnectionFactory};
use crate::config::HealthConfig;
use crate::error::{Result, SyncError};
use crate::listeners::{ListenerRegistry, Subscription};

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Run one backend call under a timeout budget.
///
/// Expiry maps to [`SyncError::ConnectionTimeout`]; the call is never left
/// pending past its budget.
pub async fn within_budget<T, F>(operation: &'static str, budget: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, BackendError>>,
{
    match tokio::time::timeout(budget, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SyncError::Backend(e)),
        Err(_) => Err(SyncError::ConnectionTimeout {
            operation,
            timeout_ms: millis(budget),
        }),
    }
}

/// Owner of the backend connection handle and of the process-wide health
/// flag.
pub struct ConnectionHealthMonitor {
    factory: Arc<dyn ConnectionFactory>,
    handle: Mutex<Option<Arc<dyn BackendConnection>>>,
    probe_timeout: Duration,
    healthy: AtomicBool,
    state_tx: watch::Sender<bool>,
    listeners: ListenerRegistry<bool>,
    rebuilds: AtomicU64,
}

impl ConnectionHealthMonitor {
    /// Create a monitor. No connection is built until one is needed.
    ///
    /// Health starts optimistic (`true`) so the first failed probe is an
    /// observable transition.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: &HealthConfig) -> Self {
        let (state_tx, _) = watch::channel(true);
        Self {
            factory,
            handle: Mutex::new(None),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            healthy: AtomicBool::new(true),
            state_tx,
            listeners: ListenerRegistry::new("connection-health"),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// The current connection handle, built on first use.
    pub fn connection(&self) -> Arc<dyn BackendConnection> {
        let mut handle = self.lock_handle();
        match handle.as_ref() {
            Some(conn) => Arc::clone(conn),
            None => {
                debug!("building backend connection");
                let conn = self.factory.connect();
                *handle = Some(Arc::clone(&conn));
                conn
            }
        }
    }

    /// Tear down the current handle and build a new one.
    pub fn reset_connection(&self) -> Arc<dyn BackendConnection> {
        let conn = self.factory.connect();
        *self.lock_handle() = Some(Arc::clone(&conn));
        let rebuilds = self.rebuilds.fetch_add(1, Ordering::SeqCst) + 1;
        info!(rebuilds, "backend connection rebuilt");
        conn
    }

    /// Number of rebuilds performed through [`reset_connection`](Self::reset_connection).
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    /// Probe the backend once.
    ///
    /// On timeout or error the probed handle is discarded so the next caller
    /// gets a fresh one.
    pub async fn check_health(&self) -> bool {
        let conn = self.connection();
        let healthy = match tokio::time::timeout(self.probe_timeout, conn.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "health probe failed");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = millis(self.probe_timeout),
                    "health probe timed out"
                );
                false
            }
        };

        if !healthy {
            self.discard(&conn);
        }
        self.set_healthy(healthy);
        healthy
    }

    /// Probe; on failure rebuild the handle and probe exactly once more.
    pub async fn check_health_with_reset(&self) -> bool {
        if self.check_health().await {
            return true;
        }
        info!("health probe failed; rebuilding connection and retrying once");
        self.reset_connection();
        self.check_health().await
    }

    /// Last known health.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Call `listener` on every health transition.
    pub fn subscribe(&self, listener: impl Fn(&bool) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Watch the health flag.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Record an out-of-band health observation (e.g. a failed mutation).
    pub fn mark_unhealthy(&self) {
        self.set_healthy(false);
    }

    fn set_healthy(&self, healthy: bool) {
        let previous = self.healthy.swap(healthy, Ordering::SeqCst);
        if previous == healthy {
            return;
        }
        if healthy {
            info!("backend connection healthy");
        } else {
            warn!("backend connection unhealthy");
        }
        self.state_tx.send_replace(healthy);
        self.listeners.notify(&healthy);
    }

    /// Drop `conn` if it is still the current handle. A handle rebuilt by a
    /// concurrent caller in the meantime is left alone.
    fn discard(&self, conn: &Arc<dyn BackendConnection>) {
        let mut handle = self.lock_handle();
        if handle.as_ref().is_some_and(|current| Arc::ptr_eq(current, conn)) {
            *handle = None;
            debug!("discarded stale backend connection");
        }
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn BackendConnection>>> {
        match self.handle.lock() {
            Ok(h) => h,
            Err(p) => p.into_inner(),
        }
    }
}
