//! Error types for the sync engine.

use fitsync_core::CoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure reported by a remote service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network trouble, a 5xx or a timeout. Worth retrying later.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Validation failure, a 4xx or a rejected conflict. Retrying the same
    /// request will fail again.
    #[error("remote rejected the request: {0}")]
    Permanent(String),
}

impl RemoteError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Returns true if this error can be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The message without the classification prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// Errors that end a sync cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local store failed.
    #[error("local store error: {0}")]
    Local(#[from] CoreError),

    /// A pull failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A remote call did not finish within the request timeout.
    #[error("remote call timed out")]
    Timeout,

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Another cycle is already running on this engine.
    #[error("a sync cycle is already in progress")]
    CycleInProgress,
}

impl SyncError {
    /// Returns true if running the cycle again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_retryable(),
            SyncError::Timeout => true,
            _ => false,
        }
    }
}
