//! Error types for backend operations.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur during backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backing store cannot be reached.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// A SQLite error occurred.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored payload could not be encoded or decoded.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a value the backend cannot interpret.
    #[error("corrupted row: {0}")]
    Corrupted(String),

    /// An item with the same id already exists.
    #[error("duplicate item id: {0}")]
    DuplicateId(String),
}

impl BackendError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable(_) => true,
            BackendError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_transient() {
        assert!(BackendError::Unavailable("down".into()).is_transient());
        assert!(!BackendError::Corrupted("bad state".into()).is_transient());
        assert!(!BackendError::DuplicateId("a".into()).is_transient());
    }

    #[test]
    fn busy_sqlite_is_transient() {
        let err = BackendError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_transient());
    }
}
