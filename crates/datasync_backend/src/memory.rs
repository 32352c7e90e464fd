//! In-memory backend for tests and single-process deployments.

use crate::backend::{LockBackend, QueueBackend};
use crate::error::{BackendError, BackendResult};
use crate::types::{ItemState, LockRow, QueueItem, QueueStats};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory queue and lock store.
///
/// Every operation runs under one mutex, which gives the same atomicity the
/// SQLite backend gets from its transactions. Sharing one instance through an
/// `Arc` between several `DurableQueue`s or `DistributedLock`s models several
/// processes sharing one store.
///
/// # Example
///
/// ```rust
/// use chrono::{Duration, Utc};
/// use datasync_backend::{InMemoryBackend, LockBackend, LockRow};
///
/// let backend = InMemoryBackend::new();
/// let now = Utc::now();
/// let row = LockRow {
///     name: "scheduler".into(),
///     holder_id: "a".into(),
///     acquired_at: now,
///     expires_at: now + Duration::seconds(20),
/// };
/// assert!(backend.try_acquire(&row, now).unwrap());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    /// Items per queue in insertion order.
    queues: BTreeMap<String, Vec<QueueItem>>,
    locks: HashMap<String, LockRow>,
}

impl InMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the connection to the store.
    ///
    /// While unavailable every operation fails with
    /// [`BackendError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("in-memory backend offline".into()))
        } else {
            Ok(())
        }
    }
}

impl QueueBackend for InMemoryBackend {
    fn ensure_queue(&self, queue: &str) -> BackendResult<()> {
        self.check_available()?;
        self.state.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    fn insert(&self, item: QueueItem) -> BackendResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let items = state.queues.entry(item.queue_name.clone()).or_default();
        if items.iter().any(|existing| existing.id == item.id) {
            return Err(BackendError::DuplicateId(item.id));
        }
        items.push(item);
        Ok(())
    }

    fn lease_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        visible_until: DateTime<Utc>,
    ) -> BackendResult<Option<QueueItem>> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(items) = state.queues.get_mut(queue) else {
            return Ok(None);
        };

        // Insertion order breaks ties between equal creation times.
        let candidate = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_leasable(now))
            .min_by_key(|(index, item)| (item.created_at, *index))
            .map(|(index, _)| index);

        Ok(candidate.map(|index| {
            let item = &mut items[index];
            item.state = ItemState::Inflight;
            item.visible_from = visible_until;
            item.attempts += 1;
            item.updated_at = now;
            item.clone()
        }))
    }

    fn complete(
        &self,
        queue: &str,
        id: &str,
        target: ItemState,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let item = state
            .queues
            .get_mut(queue)
            .and_then(|items| items.iter_mut().find(|item| item.id == id));

        match item {
            Some(item) if !item.state.is_terminal() => {
                item.state = target;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn prune(&self, queue: &str, older_than: DateTime<Utc>) -> BackendResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(items) = state.queues.get_mut(queue) else {
            return Ok(0);
        };
        let before = items.len();
        items.retain(|item| !(item.state.is_terminal() && item.updated_at < older_than));
        Ok((before - items.len()) as u64)
    }

    fn item(&self, queue: &str, id: &str) -> BackendResult<Option<QueueItem>> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .and_then(|items| items.iter().find(|item| item.id == id))
            .cloned())
    }

    fn stats(&self, queue: &str) -> BackendResult<QueueStats> {
        self.check_available()?;
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for item in state.queues.get(queue).into_iter().flatten() {
            stats.bump(item.state);
        }
        Ok(stats)
    }

    fn queue_names(&self) -> BackendResult<Vec<String>> {
        self.check_available()?;
        Ok(self.state.lock().queues.keys().cloned().collect())
    }
}

impl LockBackend for InMemoryBackend {
    fn try_acquire(&self, row: &LockRow, now: DateTime<Utc>) -> BackendResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.locks.get(&row.name) {
            Some(existing) if !existing.is_expired(now) => Ok(false),
            _ => {
                state.locks.insert(row.name.clone(), row.clone());
                Ok(true)
            }
        }
    }

    fn extend(
        &self,
        name: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> BackendResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.locks.get_mut(name) {
            Some(row) if row.holder_id == holder_id && !row.is_expired(now) => {
                row.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, name: &str, holder_id: &str) -> BackendResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state
            .locks
            .get(name)
            .is_some_and(|row| row.holder_id == holder_id)
        {
            state.locks.remove(name);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn force_release(&self, name: &str) -> BackendResult<bool> {
        self.check_available()?;
        Ok(self.state.lock().locks.remove(name).is_some())
    }

    fn lock_row(&self, name: &str) -> BackendResult<Option<LockRow>> {
        self.check_available()?;
        Ok(self.state.lock().locks.get(name).cloned())
    }
}
