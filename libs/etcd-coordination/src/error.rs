//! Error types for etcd coordination operations.
//!
//! The legacy accessors collapse every failure into a default value or a
//! [`StatusCode`](crate::StatusCode); these variants keep the distinction
//! between a missing key, an unreachable cluster, a timeout and a value that
//! does not parse.

use thiserror::Error;

/// Top-level error type for the etcd-coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation did not complete within its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The lease-backed session could not be created.
    #[error("session error: {0}")]
    Session(String),

    /// The client was never initialized or has been closed.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The key does not exist in the store.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// The stored value could not be converted to the requested type.
    #[error("cannot convert value {value:?} of key '{key}': {reason}")]
    Coercion {
        key: String,
        value: String,
        reason: String,
    },

    /// The named lock could not be acquired.
    #[error("failed to acquire lock '{name}': {reason}")]
    LockAcquire { name: String, reason: String },

    /// The named lock could not be released.
    #[error("failed to release lock '{name}': {reason}")]
    LockRelease { name: String, reason: String },

    /// Configuration error (e.g. no endpoints).
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoordinationError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (transport or timeout).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Transport(_) | CoordinationError::Timeout(_)
        )
    }

    /// Returns true if the key was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordinationError::NotFound { .. })
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::Timeout(_))
    }

    /// Returns true if the read succeeded but the value did not parse.
    pub fn is_coercion(&self) -> bool {
        matches!(self, CoordinationError::Coercion { .. })
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
