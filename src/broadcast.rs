//! Best-effort same-process notification between sibling sessions.
//!
//! Sessions (tabs) that share a [`BroadcastHub`] hear each other's timer
//! starts and stops without a network round trip. Delivery is FIFO within
//! one named channel and nothing more: no acknowledgement, no replay, no
//! cross-device reach. The durable change feed remains the source of truth.
//!
//! A [`BroadcastChannel`] never returns an error. When the mechanism is
//! unavailable (no hub, no async runtime) it degrades to a silent no-op.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::listeners::Subscription;
use crate::storage::LocalTimerSnapshot;

/// Timer notification exchanged between sibling sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerBroadcast {
    /// A timer was started; carries everything needed to render it.
    Started { snapshot: LocalTimerSnapshot },
    /// The timer with this record id was stopped.
    Stopped { entry_id: Uuid },
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    message: TimerBroadcast,
}

/// Process-wide registry of named broadcast channels.
#[derive(Debug)]
pub struct BroadcastHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl BroadcastHub {
    /// Create a hub whose channels buffer up to `capacity` messages per
    /// lagging receiver.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Open the channel called `name` for a new participant.
    pub fn open(self: &Arc<Self>, name: &str) -> BroadcastChannel {
        let sender = {
            let mut channels = match self.channels.lock() {
                Ok(c) => c,
                Err(p) => p.into_inner(),
            };
            channels
                .entry(name.to_owned())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .clone()
        };
        BroadcastChannel {
            name: name.to_owned(),
            origin: Uuid::new_v4(),
            sender: Some(sender),
        }
    }
}

/// One participant's handle on a named channel.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    name: String,
    origin: Uuid,
    sender: Option<broadcast::Sender<Envelope>>,
}

impl BroadcastChannel {
    /// A channel with no transport behind it.
    pub fn unavailable(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            origin: Uuid::new_v4(),
            sender: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.sender.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send `message` to every other participant. Fire-and-forget.
    pub fn broadcast(&self, message: TimerBroadcast) {
        let Some(sender) = &self.sender else {
            return;
        };
        let envelope = Envelope {
            origin: self.origin,
            message,
        };
        // No receivers is not an error.
        let delivered = sender.send(envelope).unwrap_or(0);
        debug!(channel = %self.name, delivered, "timer broadcast sent");
    }

    /// Invoke `callback` for every message sent by *other* participants.
    ///
    /// Messages from this handle (and its clones) are not echoed back.
    pub fn subscribe(
        &self,
        callback: impl Fn(TimerBroadcast) + Send + Sync + 'static,
    ) -> Subscription {
        let Some(sender) = &self.sender else {
            return Subscription::noop();
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(channel = %self.name, "no async runtime; broadcast subscription disabled");
            return Subscription::noop();
        };

        let mut rx = sender.subscribe();
        let origin = self.origin;
        let name = self.name.clone();
        let task = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) if envelope.origin == origin => {}
                    Ok(envelope) => {
                        let message = envelope.message;
                        if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                            warn!(channel = %name, "broadcast subscriber panicked");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "broadcast subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let abort = task.abort_handle();
        Subscription::new(move || abort.abort())
    }
}
