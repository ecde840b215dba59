//! Publish/subscribe registry with deregistration handles.
//!
//! Used for health transitions and recovery refresh signals. Listeners are
//! invoked outside the registry lock, one at a time, and a panicking
//! listener is logged and skipped so the rest of the fan-out still runs.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RegistryInner<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

/// A set of callbacks notified with a shared value.
pub struct ListenerRegistry<T> {
    name: &'static str,
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T: 'static> ListenerRegistry<T> {
    /// Create an empty registry. `name` only appears in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    /// Register `listener`. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.insert(id, Arc::new(listener));
            id
        };

        let weak: Weak<Mutex<RegistryInner<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).listeners.remove(&id);
            }
        })
    }

    /// Call every registered listener with `value`.
    ///
    /// Returns how many listeners panicked.
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot first so listeners may (un)subscribe re-entrantly.
        let listeners: Vec<Listener<T>> = lock(&self.inner).listeners.values().cloned().collect();

        let mut failures = 0;
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| (*listener)(value))).is_err() {
                failures += 1;
                warn!(registry = self.name, "listener panicked; continuing fan-out");
            }
        }
        failures
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(inner: &Mutex<RegistryInner<T>>) -> std::sync::MutexGuard<'_, RegistryInner<T>> {
    match inner.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Deregistration handle returned by every `subscribe` in this crate.
///
/// Dropping the handle unsubscribes. Call [`detach`](Self::detach) to keep
/// the subscription alive for the lifetime of its source instead.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle that owns nothing. Returned when the underlying mechanism is
    /// unavailable.
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Keep the subscription for as long as its source lives.
    pub fn detach(mut self) {
        self.release = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
