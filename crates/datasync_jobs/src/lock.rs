//! Distributed lock with bounded hold time.

use crate::clock::{add_duration, Clock};
use crate::error::JobResult;
use chrono::{DateTime, Utc};
use datasync_backend::{LockBackend, LockRow};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Proof of a successful acquisition.
///
/// The handle carries a token unique to this acquisition; renewing or
/// releasing only affects the row while it still carries that token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    name: String,
    token: String,
    max_hold: Duration,
    acquired_at: DateTime<Utc>,
    renewed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockHandle {
    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token identifying this holder.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the lock was acquired.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// When the lock expires unless renewed.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true once half the hold time since the last renewal elapsed.
    pub fn should_renew(&self, now: DateTime<Utc>) -> bool {
        now >= add_duration(self.renewed_at, self.max_hold / 2)
    }

    /// Returns true once the lock may have been taken by someone else.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Mutual exclusion across every process sharing one lock backend.
///
/// At most one unexpired holder exists per lock name. A holder that stops
/// renewing loses the lock after `max_hold`, whether it crashed or not.
///
/// # Example
///
/// ```rust
/// use datasync_backend::InMemoryBackend;
/// use datasync_jobs::{DistributedLock, SystemClock};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let backend = Arc::new(InMemoryBackend::new());
/// let a = DistributedLock::new(backend.clone(), Arc::new(SystemClock));
/// let b = DistributedLock::new(backend, Arc::new(SystemClock));
///
/// let handle = a.acquire("scheduler", Duration::from_secs(20)).unwrap().unwrap();
/// assert!(b.acquire("scheduler", Duration::from_secs(20)).unwrap().is_none());
///
/// a.release(&handle).unwrap();
/// assert!(b.acquire("scheduler", Duration::from_secs(20)).unwrap().is_some());
/// ```
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    clock: Arc<dyn Clock>,
}

impl DistributedLock {
    /// Creates a lock client.
    pub fn new(backend: Arc<dyn LockBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Tries to take lock `name` for `max_hold`.
    ///
    /// Succeeds if no holder exists or the current holder's row has expired.
    /// Returns `None` on contention.
    pub fn acquire(&self, name: &str, max_hold: Duration) -> JobResult<Option<LockHandle>> {
        let now = self.clock.now();
        let row = LockRow {
            name: name.to_string(),
            holder_id: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: add_duration(now, max_hold),
        };
        if !self.backend.try_acquire(&row, now)? {
            debug!(lock = %name, "lock held elsewhere");
            return Ok(None);
        }
        debug!(lock = %name, token = %row.holder_id, "lock acquired");
        Ok(Some(LockHandle {
            name: row.name,
            token: row.holder_id,
            max_hold,
            acquired_at: now,
            renewed_at: now,
            expires_at: row.expires_at,
        }))
    }

    /// Pushes the expiry of a held lock `max_hold` into the future.
    ///
    /// Returns false if the lock was lost; the handle is left unchanged then.
    pub fn renew(&self, handle: &mut LockHandle) -> JobResult<bool> {
        let now = self.clock.now();
        let expires_at = add_duration(now, handle.max_hold);
        if !self
            .backend
            .extend(&handle.name, &handle.token, now, expires_at)?
        {
            info!(lock = %handle.name, "lock lost before renewal");
            return Ok(false);
        }
        handle.renewed_at = now;
        handle.expires_at = expires_at;
        debug!(lock = %handle.name, "lock renewed");
        Ok(true)
    }

    /// Releases a held lock. Releasing a lost or released lock is a no-op.
    pub fn release(&self, handle: &LockHandle) -> JobResult<()> {
        if self.backend.release(&handle.name, &handle.token)? {
            debug!(lock = %handle.name, "lock released");
        }
        Ok(())
    }

    /// Clears lock `name` regardless of its holder.
    ///
    /// For operators recovering from a crashed holder. Returns true if a row
    /// was removed.
    pub fn force_release(&self, name: &str) -> JobResult<bool> {
        let removed = self.backend.force_release(name)?;
        if removed {
            info!(lock = %name, "lock force-released");
        }
        Ok(removed)
    }

    /// Reads the current row of lock `name`.
    pub fn inspect(&self, name: &str) -> JobResult<Option<LockRow>> {
        Ok(self.backend.lock_row(name)?)
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
