//! Optimistic-concurrency collisions.

use crate::pending::{PendingAction, PendingRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A client change whose pre-change hash no longer matched the authoritative
/// record when it was processed.
///
/// Collisions are kept until removed explicitly through the collision API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collision {
    /// The stale pre-change hash the client submitted. Creates carry no
    /// pre-change hash and use the change identifier instead.
    pub hash: String,
    /// Dataset of the record.
    pub dataset_id: String,
    /// Record the change targeted.
    pub uid: String,
    /// Submitting client.
    pub client_id: String,
    /// Identifier of the rejected change.
    pub pending_hash: String,
    /// Requested mutation.
    pub action: PendingAction,
    /// Server value at the time of the collision.
    pub pre_value: Option<serde_json::Value>,
    /// Value the client wanted to write.
    pub post_value: Option<serde_json::Value>,
    /// When the collision was detected.
    pub timestamp: DateTime<Utc>,
}

impl Collision {
    /// Builds a collision from a rejected pending record and the current
    /// server value of its target.
    pub fn from_pending(
        record: &PendingRecord,
        current: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let post_value = match record.action {
            PendingAction::Delete => None,
            _ => Some(record.fields.clone()),
        };
        Self {
            hash: record
                .pre_hash
                .clone()
                .unwrap_or_else(|| record.hash.clone()),
            dataset_id: record.dataset_id.clone(),
            uid: record.uid.clone(),
            client_id: record.client_id.clone(),
            pending_hash: record.hash.clone(),
            action: record.action,
            pre_value: current,
            post_value,
            timestamp: now,
        }
    }

    /// The client created a record that already exists on the server.
    pub fn is_create_conflict(&self) -> bool {
        self.action == PendingAction::Create && self.pre_value.is_some()
    }

    /// Exactly one side removed the record.
    pub fn is_update_delete_conflict(&self) -> bool {
        self.pre_value.is_none() != self.post_value.is_none()
    }
}
