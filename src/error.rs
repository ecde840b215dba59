//! Error types for the session coordination layer.

use crate::backend::BackendError;

/// Top-level error type for client-session coordination.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Caller supplied input that can never succeed.
    #[error("validation error: {0}")]
    Validation(String),

    /// An active timer already exists for this owner.
    #[error("a timer is already running")]
    AlreadyRunning,

    /// Stop was requested but no timer is running.
    #[error("no active timer")]
    NoActiveTimer,

    /// An I/O boundary exceeded its timeout budget.
    #[error("{operation} timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Which operation ran out of budget.
        operation: &'static str,
        /// The budget that was exceeded.
        timeout_ms: u64,
    },

    /// The backend connection is known to be unhealthy.
    #[error("connection unhealthy: {0}")]
    ConnectionUnhealthy(String),

    /// The auth-refresh collaborator failed.
    #[error("auth refresh failed: {0}")]
    AuthRefreshFailed(String),

    /// A locally cached snapshot could not be decoded.
    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    /// The backend rejected or failed a request.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether this failure says something about the network rather than
    /// about the request itself.
    ///
    /// Write-path callers use this to decide whether to request a recovery
    /// run after a failed mutation.
    pub fn is_connection_class(&self) -> bool {
        match self {
            Self::ConnectionTimeout { .. } | Self::ConnectionUnhealthy(_) => true,
            Self::Backend(err) => err.is_transport(),
            _ => false,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SyncError>;
