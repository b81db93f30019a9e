//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// A missing object is not an error at this boundary: `get` reports it
/// through [`crate::GetStatus::NotFound`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Network or service error that survived the client's own retries.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Stored data is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The store is closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transport { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(StorageError::transport_retryable("503 slow down").is_retryable());
        assert!(!StorageError::transport_fatal("403 forbidden").is_retryable());
        assert!(!StorageError::Closed.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = StorageError::Corrupted("bad record".into());
        assert_eq!(err.to_string(), "storage corrupted: bad record");
    }
}
