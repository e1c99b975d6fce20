//! Error types for coordination operations.
//!
//! [`BackendError`] is what the coordination service (or the transport to
//! it) reports; it carries the recoverable/terminal classification every
//! fault policy keys off. [`CoordinationError`] is what callers of the
//! client see.

use std::time::Duration;

use thiserror::Error;

use crate::backend::LeaseId;

/// Failure reported by a [`Backend`](crate::backend::Backend) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Connection reset, refused, or otherwise broken transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not complete within its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The service is temporarily unable to serve requests.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The cluster is between leaders; the request can be replayed.
    #[error("leader changed: {0}")]
    LeaderChanged(String),

    /// A watch or keepalive stream ended unexpectedly.
    #[error("watch closed: {0}")]
    WatchClosed(String),

    /// Authentication or authorization failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The lease does not exist (never granted, revoked, or expired).
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// The backend reported the lease TTL as elapsed.
    #[error("lease {0} expired")]
    LeaseExpired(LeaseId),

    /// Anything the classification does not know about.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Returns true if the failure is transient and the call may succeed if
    /// replayed (network blips, leader transitions, closed streams).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::Transport(_)
                | BackendError::Timeout(_)
                | BackendError::Unavailable(_)
                | BackendError::LeaderChanged(_)
                | BackendError::WatchClosed(_)
        )
    }

    /// Returns true if the error means the lease is gone for good.
    pub fn is_lease_gone(&self) -> bool {
        matches!(
            self,
            BackendError::LeaseNotFound(_) | BackendError::LeaseExpired(_)
        )
    }
}

/// Top-level error type for the coordination crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// Operation attempted before `connect` or after `disconnect`.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The backend rejected the call and retries (if any) did not help.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The per-host circuit breaker is open and rejected the call.
    #[error("circuit open for host '{host}', retry in {retry_in:?}")]
    CircuitOpen { host: String, retry_in: Duration },

    /// A cancellation signal fired while the operation was pending.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Invalid configuration or arguments supplied by the caller.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoordinationError {
    /// Returns true if this error is `NotConnected`.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, CoordinationError::NotConnected(_))
    }

    /// Returns true if this error is an abort.
    pub fn is_aborted(&self) -> bool {
        matches!(self, CoordinationError::Aborted(_))
    }

    /// Returns the backend error, if this wraps one.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            CoordinationError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

/// Shorthand result alias for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
