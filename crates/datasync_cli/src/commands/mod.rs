//! CLI command implementations.

pub mod config;
pub mod lock;
pub mod prune;
pub mod queues;

use datasync_backend::SqliteBackend;
use std::path::Path;
use tracing::debug;

/// Opens the shared database file. Refuses to create a new one.
pub fn open_backend(path: &Path) -> Result<SqliteBackend, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    debug!(db = %path.display(), "opening database");
    Ok(SqliteBackend::open(path)?)
}
