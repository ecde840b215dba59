//! Backend contract consumed by the coordination layer.
//!
//! The record store, realtime change feed and presence channel live on the
//! server. This module only describes the shapes that cross that boundary
//! and the [`BackendConnection`] seam the rest of the crate talks through.
//!
//! The store is authoritative: it assigns record ids and timestamps from its
//! own clock and enforces at most one open timer per owner. Clients never
//! compute correctness-bearing values from their local clock.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::presence::PresenceEntry;

/// The thing a timer or a viewer is attached to (task, project, note...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity kind, e.g. `task`.
    pub entity_type: String,
    /// Entity identifier within its kind.
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Realtime topic name used for presence on this entity.
    pub fn presence_topic(&self) -> String {
        format!("presence:{}:{}", self.entity_type, self.entity_id)
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A time-tracking record as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTimerRecord {
    /// Server-assigned record id.
    pub id: Uuid,
    /// User that owns the timer.
    pub owner_id: String,
    pub entity_type: String,
    pub entity_id: String,
    /// Server clock at insert time.
    pub start_time: DateTime<Utc>,
    /// `None` while the timer is running.
    pub end_time: Option<DateTime<Utc>>,
    /// Whole seconds, set when the timer is closed.
    pub duration_secs: Option<i64>,
    /// IANA timezone name of the client that started the timer.
    pub timezone: String,
}

impl ActiveTimerRecord {
    /// Whether the record is still open (no end time).
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// Insert payload for a new timer. The server fills in id and start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTimerRecord {
    pub owner_id: String,
    pub entity: EntityRef,
    pub timezone: String,
}

/// Kind of change delivered by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

/// One change-feed notification. Delivery is at-least-once and unordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub old: Option<ActiveTimerRecord>,
    pub new: Option<ActiveTimerRecord>,
}

impl ChangeEvent {
    /// The record the event is about, preferring the new image.
    pub fn record(&self) -> Option<&ActiveTimerRecord> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// Change-feed subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub owner_id: String,
    /// Restrict to one entity; `None` means every entity of the owner.
    pub entity: Option<EntityRef>,
}

impl ChangeFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            entity: None,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let Some(record) = event.record() else {
            return false;
        };
        if record.owner_id != self.owner_id {
            return false;
        }
        match &self.entity {
            Some(entity) => {
                record.entity_type == entity.entity_type && record.entity_id == entity.entity_id
            }
            None => true,
        }
    }
}

/// Presence state of one topic: replica key (one per tab/device) to the
/// payloads that replica is tracking.
pub type RosterSnapshot = HashMap<String, Vec<PresenceEntry>>;

/// Errors reported by a backend connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The owner already holds an open timer.
    #[error("owner {owner_id} already has an open timer")]
    UniqueViolation {
        /// Owner whose constraint was hit.
        owner_id: String,
    },

    /// The record does not exist or is no longer open.
    #[error("timer record {id} not found")]
    NotFound {
        /// Record that was looked up.
        id: Uuid,
    },

    /// Network-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection handle has been shut down.
    #[error("connection closed")]
    Closed,
}

impl BackendError {
    /// Whether the error is about the connection rather than the data.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed)
    }
}

/// One live connection to the backend.
///
/// Handles may silently stop working after the client process is suspended
/// ("zombie" connections). Callers wrap every call in a timeout and the
/// health monitor replaces handles that stop answering.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Minimal existence-only query used as a liveness probe.
    async fn probe(&self) -> Result<(), BackendError>;

    /// The owner's open timer, if any.
    async fn open_timer(&self, owner_id: &str) -> Result<Option<ActiveTimerRecord>, BackendError>;

    /// Insert a new open timer. Fails with [`BackendError::UniqueViolation`]
    /// when the owner already has one.
    async fn insert_timer(&self, new: NewTimerRecord) -> Result<ActiveTimerRecord, BackendError>;

    /// Close an open timer. The backend stamps `end_time` with its own
    /// clock at write time and stores `end_time - start_time` as the
    /// duration.
    async fn close_timer(&self, id: Uuid) -> Result<ActiveTimerRecord, BackendError>;

    /// Subscribe to timer changes matching `filter`.
    async fn subscribe_changes(
        &self,
        filter: ChangeFilter,
    ) -> Result<mpsc::UnboundedReceiver<ChangeEvent>, BackendError>;

    /// Publish (or refresh) this replica's presence payload on `topic`.
    async fn track_presence(
        &self,
        topic: &str,
        replica: &str,
        entry: PresenceEntry,
    ) -> Result<(), BackendError>;

    /// Subscribe to full roster snapshots of `topic`.
    async fn subscribe_presence(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<RosterSnapshot>, BackendError>;
}

/// Builds fresh connection handles. Used for lazy construction and for
/// rebuilding a handle that stopped answering.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> Arc<dyn BackendConnection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Arc<dyn BackendConnection> + Send + Sync,
{
    fn connect(&self) -> Arc<dyn BackendConnection> {
        self()
    }
}
