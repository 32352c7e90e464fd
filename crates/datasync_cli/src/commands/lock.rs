//! Lock inspection and recovery.

use datasync_backend::LockRow;
use datasync_jobs::{Clock, DistributedLock, SystemClock};
use std::path::Path;
use std::sync::Arc;

fn open_lock(path: &Path) -> Result<(DistributedLock, Arc<SystemClock>), Box<dyn std::error::Error>> {
    let backend = super::open_backend(path)?;
    let clock = Arc::new(SystemClock);
    Ok((DistributedLock::new(Arc::new(backend), clock.clone()), clock))
}

/// Runs the lock command.
pub fn show(path: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (lock, clock) = open_lock(path)?;
    match lock.inspect(name)? {
        Some(row) => print_row(&row, clock.as_ref()),
        None => println!("Lock {} is free", name),
    }
    Ok(())
}

/// Runs the release-lock command.
pub fn release(path: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (lock, _) = open_lock(path)?;
    if lock.force_release(name)? {
        println!("Released lock {}", name);
    } else {
        println!("Lock {} was not held", name);
    }
    Ok(())
}

fn print_row(row: &LockRow, clock: &dyn Clock) {
    let state = if row.expires_at <= clock.now() {
        "expired"
    } else {
        "held"
    };
    println!("Lock:        {}", row.name);
    println!("State:       {}", state);
    println!("Holder:      {}", row.holder_id);
    println!("Acquired at: {}", row.acquired_at.to_rfc3339());
    println!("Expires at:  {}", row.expires_at.to_rfc3339());
}
