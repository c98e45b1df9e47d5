//! Error types for the local store.

use crate::types::WorkoutId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the local store and mutation log.
///
/// Every variant is local: nothing in this crate talks to the network, so
/// none of these are retryable by waiting.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] fitsync_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The journal contains a structurally invalid frame.
    #[error("journal corruption at offset {offset}: {message}")]
    JournalCorruption {
        /// Byte offset of the offending frame.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A journal frame failed its CRC check.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Byte offset of the frame.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// No record with this id exists.
    #[error("workout not found: {0}")]
    NotFound(WorkoutId),

    /// A record with this id already exists (possibly as a tombstone).
    #[error("workout already exists: {0}")]
    AlreadyExists(WorkoutId),

    /// The record is tombstoned and cannot be changed any more.
    #[error("workout is deleted: {0}")]
    RecordDeleted(WorkoutId),

    /// The caller passed an invalid value.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// An earlier write failed half-way and the journal refuses more writes.
    #[error("journal is poisoned by an earlier write failure; reopen the database")]
    Poisoned,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn journal_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true for errors that mean the on-disk journal cannot be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::JournalCorruption { .. } | Self::ChecksumMismatch { .. }
        )
    }
}
