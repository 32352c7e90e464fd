//! Error types for payload handling.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload is not valid JSON for the expected type.
    #[error("invalid payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload decoded but violates a structural rule.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates an [`ProtocolError::Invalid`] error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
