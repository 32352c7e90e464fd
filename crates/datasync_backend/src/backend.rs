//! Backend trait definitions.

use crate::error::BackendResult;
use crate::types::{ItemState, LockRow, QueueItem, QueueStats};
use chrono::{DateTime, Utc};

/// Persistence for durable queue items.
///
/// Queue backends are shared by every worker of every process, so each
/// method must be atomic against the underlying store on its own.
///
/// # Invariants
///
/// - `lease_next` selects and transitions in one atomic step; two concurrent
///   callers never receive the same item while its lease is valid
/// - Terminal items (`done`, `failed`) never become leasable again
/// - `complete` and `prune` are idempotent
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For tests
/// - [`super::SqliteBackend`] - For fleets sharing one database file
pub trait QueueBackend: Send + Sync {
    /// Ensures storage for `queue` exists. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BackendError::Unavailable`] if the store cannot be reached.
    fn ensure_queue(&self, queue: &str) -> BackendResult<()>;

    /// Inserts a new item.
    ///
    /// # Errors
    ///
    /// Returns an error if the id already exists or the store fails.
    fn insert(&self, item: QueueItem) -> BackendResult<()>;

    /// Leases the oldest leasable item of `queue`.
    ///
    /// The selected item becomes `inflight`, its `visible_from` is set to
    /// `visible_until` and its `attempts` counter is incremented. Returns
    /// `None` when nothing is leasable at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn lease_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        visible_until: DateTime<Utc>,
    ) -> BackendResult<Option<QueueItem>>;

    /// Moves a non-terminal item to the terminal `state`.
    ///
    /// Returns false when the item is missing or already terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn complete(
        &self,
        queue: &str,
        id: &str,
        state: ItemState,
        now: DateTime<Utc>,
    ) -> BackendResult<bool>;

    /// Deletes terminal items last updated before `older_than`.
    ///
    /// Returns the number of deleted items.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn prune(&self, queue: &str, older_than: DateTime<Utc>) -> BackendResult<u64>;

    /// Reads one item by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn item(&self, queue: &str, id: &str) -> BackendResult<Option<QueueItem>>;

    /// Counts items per state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn stats(&self, queue: &str) -> BackendResult<QueueStats>;

    /// Names of every queue created in this store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn queue_names(&self) -> BackendResult<Vec<String>>;
}

/// Persistence for distributed lock rows.
pub trait LockBackend: Send + Sync {
    /// Stores `row` if no row exists for `row.name` or the existing row has
    /// expired at `now`. Returns true when the row was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn try_acquire(&self, row: &LockRow, now: DateTime<Utc>) -> BackendResult<bool>;

    /// Moves `expires_at` forward for a row still held by `holder_id` and not
    /// yet expired at `now`. Returns false if the lock was lost.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn extend(
        &self,
        name: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> BackendResult<bool>;

    /// Deletes the row if it is held by `holder_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn release(&self, name: &str, holder_id: &str) -> BackendResult<bool>;

    /// Deletes the row regardless of holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn force_release(&self, name: &str) -> BackendResult<bool>;

    /// Reads the row for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn lock_row(&self, name: &str) -> BackendResult<Option<LockRow>>;
}
