//! Trackline: client-session coordination for a multi-user task tracker.
//!
//! Every browser tab or device a user opens is one [`ClientSession`]. The
//! crate keeps those sessions consistent with each other and with the
//! backend:
//!
//! - **Timer exclusivity**: at most one running timer per user, enforced by
//!   the backend and pre-checked locally; durations use the server clock.
//! - **Local persistence**: the running timer survives a reload.
//! - **Broadcast sync**: sibling tabs see starts and stops immediately.
//! - **Presence**: who else is looking at an entity, with heartbeat and
//!   staleness eviction.
//! - **Connection health**: liveness probes and rebuild of zombie handles.
//! - **Recovery**: health, auth and data refresh after the client returns
//!   from the background.
//!
//! The backend itself is behind [`backend::BackendConnection`];
//! [`backend::memory::MemoryBackend`] is an in-process implementation used
//! by tests and the simulator.

pub mod backend;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod listeners;
pub mod presence;
pub mod recovery;
pub mod session;
pub mod storage;
pub mod timer;
pub mod trackline_dirs;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use recovery::{AuthConfidence, RecoveryState, RecoveryStatus, Visibility, should_queue_mutation};
pub use session::{ClientSession, ClientSessionBuilder};
pub use timer::{TimerExclusivityCoordinator, format_elapsed};
