//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised at the wire boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A log entry failed schema validation.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A log key does not have the `<manifest>@<time>_<session>_<seq>` shape.
    #[error("invalid log key: {0}")]
    InvalidLogKey(String),

    /// A reference string could not be parsed.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// An encoded integer is malformed or out of range.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates an invalid-manifest error.
    pub fn invalid_manifest(message: impl Into<String>) -> Self {
        Self::InvalidManifest(message.into())
    }
}
