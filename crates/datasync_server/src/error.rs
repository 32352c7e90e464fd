//! Error types for the sync server.

use datasync_jobs::JobError;
use datasync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A request or payload failed protocol validation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server is missing a required collaborator or setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage cannot be reached. Retrying later may succeed.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A dataset handler failed.
    #[error("dataset handler error: {0}")]
    Handler(String),

    /// Queue, worker or lock failure.
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// Encoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the caller sent something wrong.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_) | ServerError::Protocol(_)
        )
    }

    /// Returns true if the failure is on the server side.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }
}

impl From<ServerError> for JobError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Job(e) => e,
            ServerError::Protocol(e) => JobError::from(e),
            ServerError::InvalidRequest(msg) => JobError::InvalidPayload(msg),
            ServerError::Configuration(msg) => JobError::processing_fatal(msg),
            other => JobError::processing_retryable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::StorageUnavailable("down".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(ServerError::Protocol(ProtocolError::invalid("uid", "empty")).is_client_error());
    }

    #[test]
    fn job_error_mapping() {
        let err: JobError = ServerError::StorageUnavailable("down".into()).into();
        assert!(err.is_retryable());

        let err: JobError = ServerError::Protocol(ProtocolError::invalid("uid", "empty")).into();
        assert!(matches!(err, JobError::InvalidPayload(_)));

        let err: JobError = ServerError::Configuration("no storage".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ServerError::Configuration("queue backend not set".into());
        assert_eq!(err.to_string(), "configuration error: queue backend not set");
    }
}
