//! Error types for the engine.

use bucketlog_protocol::ProtocolError;
use bucketlog_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while reading or writing through a manifest.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Local or remote storage failed outside the transport layer.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Network or transport error that the object store could not recover.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed data at the protocol boundary.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A log entry failed validation.
    #[error("invalid manifest entry {key}: {reason}")]
    InvalidManifest {
        /// Log key of the entry.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A content write came back without a version identifier.
    #[error("bucket versioning required: no version id returned for {reference}")]
    VersioningRequired {
        /// The reference being written.
        reference: String,
    },

    /// Log keys kept landing outside the tolerated clock skew.
    #[error("clock skew of {skew_ms}ms after {attempts} attempts")]
    ClockSkew {
        /// Number of log entries written and discarded.
        attempts: u32,
        /// Last observed difference between server and local time.
        skew_ms: i64,
    },

    /// Log entries kept disappearing while folding.
    #[error("manifest log changed during {attempts} consecutive folds")]
    FoldRetriesExhausted {
        /// Number of folds attempted.
        attempts: u32,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Remote durability was requested while offline.
    #[error("client is offline")]
    Offline,

    /// A write named no values.
    #[error("write contains no values")]
    EmptyWrite,

    /// The configuration does not allow the operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
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
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::Storage(e) => e.is_retryable(),
            EngineError::ClockSkew { .. } => true,
            EngineError::FoldRetriesExhausted { .. } => true,
            EngineError::Offline => true,
            _ => false,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transport { message, retryable } => {
                EngineError::Transport { message, retryable }
            }
            other => EngineError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Protocol(ProtocolError::Json(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(EngineError::transport_retryable("connection reset").is_retryable());
        assert!(!EngineError::transport_fatal("access denied").is_retryable());
        assert!(EngineError::ClockSkew {
            attempts: 3,
            skew_ms: 9000
        }
        .is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::VersioningRequired {
            reference: "b/k".into()
        }
        .is_retryable());
    }

    #[test]
    fn storage_transport_becomes_engine_transport() {
        let err: EngineError = StorageError::transport_retryable("503").into();
        assert!(matches!(
            err,
            EngineError::Transport {
                retryable: true,
                ..
            }
        ));

        let err: EngineError = StorageError::Closed.into();
        assert!(matches!(err, EngineError::Storage(StorageError::Closed)));
    }

    #[test]
    fn error_display() {
        let err = EngineError::ClockSkew {
            attempts: 2,
            skew_ms: -61000,
        };
        assert!(err.to_string().contains("-61000"));
        assert_eq!(EngineError::Offline.to_string(), "client is offline");
    }
}
