//! Row types owned by the backing store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Waiting to be leased.
    Pending,
    /// Leased by a worker until `visible_from`.
    Inflight,
    /// Acknowledged by a worker.
    Done,
    /// Given up on after exhausting attempts or an unrecoverable payload.
    Failed,
}

impl ItemState {
    /// Stable name used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Inflight => "inflight",
            ItemState::Done => "done",
            ItemState::Failed => "failed",
        }
    }

    /// Parses a persisted state name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ItemState::Pending),
            "inflight" => Some(ItemState::Inflight),
            "done" => Some(ItemState::Done),
            "failed" => Some(ItemState::Failed),
            _ => None,
        }
    }

    /// Returns true for `done` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Done | ItemState::Failed)
    }
}

/// A durable queue item.
///
/// An item is leasable while it is `pending`, or `inflight` with a
/// `visible_from` in the past (its previous lease expired without an ack).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item id.
    pub id: String,
    /// Owning queue.
    pub queue_name: String,
    /// Job payload.
    pub payload: serde_json::Value,
    /// Current state.
    pub state: ItemState,
    /// Instant from which the item may be leased (again).
    pub visible_from: DateTime<Utc>,
    /// Number of times the item has been leased.
    pub attempts: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Creates a new pending item, visible immediately.
    pub fn new(
        id: impl Into<String>,
        queue_name: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            payload,
            state: ItemState::Pending,
            visible_from: now,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if a `lease_next` at `now` may select this item.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, ItemState::Pending | ItemState::Inflight) && self.visible_from <= now
    }
}

/// Per-state item counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items waiting to be leased.
    pub pending: u64,
    /// Items currently leased (including expired leases).
    pub inflight: u64,
    /// Acknowledged items not yet pruned.
    pub done: u64,
    /// Failed items not yet pruned.
    pub failed: u64,
}

impl QueueStats {
    /// Total number of rows in the queue.
    pub fn total(&self) -> u64 {
        self.pending + self.inflight + self.done + self.failed
    }

    pub(crate) fn bump(&mut self, state: ItemState) {
        match state {
            ItemState::Pending => self.pending += 1,
            ItemState::Inflight => self.inflight += 1,
            ItemState::Done => self.done += 1,
            ItemState::Failed => self.failed += 1,
        }
    }
}

/// A distributed lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRow {
    /// Lock name.
    pub name: String,
    /// Token of the current holder.
    pub holder_id: String,
    /// When the current holder acquired the lock.
    pub acquired_at: DateTime<Utc>,
    /// When the lock is considered abandoned.
    pub expires_at: DateTime<Utc>,
}

impl LockRow {
    /// Returns true once `expires_at` has been reached.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn state_names_roundtrip() {
        for state in [
            ItemState::Pending,
            ItemState::Inflight,
            ItemState::Done,
            ItemState::Failed,
        ] {
            assert_eq!(ItemState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ItemState::parse("queued"), None);
    }

    #[test]
    fn leasable_rules() {
        let now = Utc::now();
        let mut item = QueueItem::new("a", "q", serde_json::Value::Null, now);
        assert!(item.is_leasable(now));

        item.state = ItemState::Inflight;
        item.visible_from = now + Duration::seconds(10);
        assert!(!item.is_leasable(now));
        assert!(item.is_leasable(now + Duration::seconds(10)));

        item.state = ItemState::Done;
        assert!(!item.is_leasable(now + Duration::seconds(60)));
    }

    #[test]
    fn lock_expiry() {
        let now = Utc::now();
        let row = LockRow {
            name: "l".into(),
            holder_id: "h".into(),
            acquired_at: now,
            expires_at: now + Duration::seconds(5),
        };
        assert!(!row.is_expired(now));
        assert!(row.is_expired(now + Duration::seconds(5)));
    }
}
