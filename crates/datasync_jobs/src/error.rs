//! Error types for the job pipeline.

use datasync_backend::BackendError;
use datasync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors that can occur while queueing, leasing or processing jobs.
#[derive(Error, Debug)]
pub enum JobError {
    /// The backing store failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A queue item's payload cannot be decoded. Retrying will not help.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A processor failed.
    #[error("processing failed: {message}")]
    Processing {
        /// Error message.
        message: String,
        /// Whether a later attempt may succeed.
        retryable: bool,
    },
}

impl JobError {
    /// Creates a retryable processing error.
    pub fn processing_retryable(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable processing error.
    pub fn processing_fatal(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the failed item should be left for another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Backend(e) => {
                !matches!(e, BackendError::Corrupted(_) | BackendError::Serialization(_))
            }
            JobError::InvalidPayload(_) => false,
            JobError::Processing { retryable, .. } => *retryable,
        }
    }
}

impl From<ProtocolError> for JobError {
    fn from(err: ProtocolError) -> Self {
        JobError::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(JobError::processing_retryable("storage busy").is_retryable());
        assert!(!JobError::processing_fatal("unknown dataset").is_retryable());
        assert!(JobError::Backend(BackendError::Unavailable("down".into())).is_retryable());
        assert!(!JobError::Backend(BackendError::Corrupted("bad state".into())).is_retryable());
        assert!(!JobError::InvalidPayload("not json".into()).is_retryable());
    }

    #[test]
    fn protocol_errors_are_invalid_payloads() {
        let err = JobError::from(ProtocolError::invalid("uid", "must not be empty"));
        assert!(matches!(err, JobError::InvalidPayload(_)));
        assert_eq!(err.to_string(), "invalid payload: invalid uid: must not be empty");
    }
}
