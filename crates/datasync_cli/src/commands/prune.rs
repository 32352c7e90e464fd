//! One-off prune pass.

use datasync_jobs::{DurableQueue, QueueConfig, SystemClock};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Runs the prune command.
pub fn run(path: &Path, queue: &str, retention: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let backend = super::open_backend(path)?;
    let queue = DurableQueue::new(
        queue,
        Arc::new(backend),
        Arc::new(SystemClock),
        QueueConfig::new().with_retention(retention),
    );
    let removed = queue.prune()?;
    println!(
        "Pruned {} finished items older than {}s from {}",
        removed,
        retention.as_secs(),
        queue.name()
    );
    Ok(())
}
