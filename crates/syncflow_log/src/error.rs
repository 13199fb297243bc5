//! Error types for the action log.

use crate::record::RecordId;
use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur while appending to or reading the action log.
#[derive(Error, Debug)]
pub enum LogError {
    /// I/O error from a durable journal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The journal refused the write.
    #[error("storage fault: {message}")]
    Storage {
        /// Error message.
        message: String,
    },

    /// Encoding or decoding of a journal frame or archive failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A different record already exists under this id.
    #[error("record {id} already exists with different contents")]
    DuplicateRecord {
        /// The conflicting id.
        id: RecordId,
    },

    /// A referenced record is not in the log.
    #[error("unknown record: {id}")]
    UnknownRecord {
        /// The missing id.
        id: RecordId,
    },

    /// The journal contents are unreadable.
    #[error("journal corrupted: {0}")]
    Corrupted(String),
}

impl LogError {
    /// Creates a storage fault.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Returns true if the caller may retry the failed operation unchanged.
    #[must_use]
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage { .. })
    }
}
