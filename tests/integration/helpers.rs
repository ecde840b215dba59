//! Shared helpers for integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use trackline::ClientSession;
use trackline::backend::memory::MemoryBackend;
use trackline::broadcast::BroadcastHub;
use trackline::clock::ManualClock;
use trackline::presence::PresenceIdentity;
use trackline::storage::{MemorySnapshotStore, SnapshotStore};

/// One simulated server plus the shared pieces a browser gives its tabs.
pub(crate) struct World {
    pub clock: ManualClock,
    pub backend: MemoryBackend,
    pub hub: Arc<BroadcastHub>,
    /// Local storage shared by every tab of the simulated browser.
    pub browser_storage: MemorySnapshotStore,
}

impl World {
    pub fn new() -> Self {
        let clock = ManualClock::new(t0());
        let backend = MemoryBackend::new(Arc::new(clock.clone()));
        Self {
            clock,
            backend,
            hub: BroadcastHub::new(64),
            browser_storage: MemorySnapshotStore::new(),
        }
    }

    /// A tab in the shared browser.
    pub async fn tab(&self, user: &str) -> ClientSession {
        self.session(user, Arc::new(self.browser_storage.clone()), true)
            .await
    }

    /// A separate device: own storage, no broadcast reach.
    pub async fn device(&self, user: &str) -> ClientSession {
        self.session(user, Arc::new(MemorySnapshotStore::new()), false)
            .await
    }

    pub async fn session(
        &self,
        user: &str,
        store: Arc<dyn SnapshotStore>,
        same_browser: bool,
    ) -> ClientSession {
        let mut builder = ClientSession::builder(identity(user), self.backend.factory())
            .clock(Arc::new(self.clock.clone()))
            .snapshot_store(store);
        if same_browser {
            builder = builder.broadcast_hub(Arc::clone(&self.hub));
        }
        builder.build().await
    }
}

pub(crate) fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_767_225_600, 0).expect("valid timestamp")
}

pub(crate) fn identity(user: &str) -> PresenceIdentity {
    PresenceIdentity {
        user_id: user.to_owned(),
        display_name: capitalize(user),
        avatar_ref: Some(format!("avatars/{user}.png")),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Wait until `rx` satisfies `pred`, failing the test after `within`.
pub(crate) async fn wait_until<T>(
    rx: &mut watch::Receiver<T>,
    within: Duration,
    pred: impl FnMut(&T) -> bool,
) {
    tokio::time::timeout(within, rx.wait_for(pred))
        .await
        .expect("condition not reached in time")
        .expect("sender dropped");
}
