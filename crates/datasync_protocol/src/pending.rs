//! Client-submitted changes and their outcomes.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The mutation a pending change requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingAction {
    /// Insert a new record.
    Create,
    /// Replace an existing record.
    Update,
    /// Remove an existing record.
    Delete,
}

impl PendingAction {
    /// Returns true if the action carries a post-change value.
    pub fn has_post_value(self) -> bool {
        !matches!(self, Self::Delete)
    }
}

/// Processing state of a [`PendingRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    /// Received, not processed yet.
    Clean,
    /// The client's pre-change hash was stale. Storage was not mutated.
    Collision,
    /// Merged into storage.
    Applied,
}

impl PendingStatus {
    /// Returns true once the change has a final outcome.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Clean)
    }
}

/// A change as submitted by a client in a sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Client-generated identifier of this change.
    pub hash: String,
    /// Target record.
    pub uid: String,
    /// Requested mutation.
    pub action: PendingAction,
    /// Hash of the record the client based the change on. `None` when the
    /// client believes the record does not exist.
    #[serde(default)]
    pub pre_hash: Option<String>,
    /// Hash of the record after the change, as computed by the client.
    #[serde(default)]
    pub post_hash: Option<String>,
    /// New record value for create and update.
    #[serde(default)]
    pub post: Option<serde_json::Value>,
}

impl PendingChange {
    /// Checks the structural rules a change must satisfy before it is queued.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.hash.is_empty() {
            return Err(ProtocolError::invalid("hash", "must not be empty"));
        }
        if self.uid.is_empty() {
            return Err(ProtocolError::invalid("uid", "must not be empty"));
        }
        if self.action.has_post_value() && self.post.is_none() {
            return Err(ProtocolError::invalid(
                "post",
                "create and update changes need a post value",
            ));
        }
        if self.action != PendingAction::Create && self.pre_hash.is_none() {
            return Err(ProtocolError::invalid(
                "preHash",
                "update and delete changes need a pre-change hash",
            ));
        }
        Ok(())
    }
}

/// Server-side bookkeeping for one pending change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    /// Dataset the change targets.
    pub dataset_id: String,
    /// Submitting client.
    pub client_id: String,
    /// Client-generated identifier of the change.
    pub hash: String,
    /// Target record.
    pub uid: String,
    /// Requested mutation.
    pub action: PendingAction,
    /// New record value, `Null` for deletes.
    pub fields: serde_json::Value,
    /// Hash the client based the change on.
    pub pre_hash: Option<String>,
    /// Client-computed post-change hash.
    pub post_hash: Option<String>,
    /// Processing state.
    pub status: PendingStatus,
    /// Queue item that carried the change, used to recognise redeliveries.
    pub job_id: Option<String>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl PendingRecord {
    /// Creates a `clean` record for a submitted change.
    pub fn received(
        dataset_id: impl Into<String>,
        client_id: impl Into<String>,
        change: &PendingChange,
        job_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            client_id: client_id.into(),
            hash: change.hash.clone(),
            uid: change.uid.clone(),
            action: change.action,
            fields: change.post.clone().unwrap_or(serde_json::Value::Null),
            pre_hash: change.pre_hash.clone(),
            post_hash: change.post_hash.clone(),
            status: PendingStatus::Clean,
            job_id,
            updated_at: now,
        }
    }

    /// Moves the record to a new status.
    pub fn transition(&mut self, status: PendingStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    /// Returns true if the record was already processed from queue item `job_id`.
    pub fn processed_by(&self, job_id: &str) -> bool {
        self.status.is_terminal() && self.job_id.as_deref() == Some(job_id)
    }
}

/// Result of a processed change, delivered to the submitting client until
/// it acknowledges it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOutcome {
    /// Dataset of the change.
    pub dataset_id: String,
    /// Submitting client.
    pub client_id: String,
    /// Client-generated identifier of the change.
    pub hash: String,
    /// Target record.
    pub uid: String,
    /// Requested mutation.
    pub action: PendingAction,
    /// `Applied` or `Collision`.
    pub status: PendingStatus,
    /// Authoritative record hash after processing.
    pub record_hash: Option<String>,
    /// Queue item the change was processed from. A change submitted twice
    /// has one outcome per submission.
    #[serde(default)]
    pub job_id: Option<String>,
    /// When the outcome was reached.
    pub timestamp: DateTime<Utc>,
}

impl PendingOutcome {
    /// Builds the outcome of a processed record.
    pub fn of(record: &PendingRecord, record_hash: Option<String>) -> Self {
        Self {
            dataset_id: record.dataset_id.clone(),
            client_id: record.client_id.clone(),
            hash: record.hash.clone(),
            uid: record.uid.clone(),
            action: record.action,
            status: record.status,
            record_hash,
            job_id: record.job_id.clone(),
            timestamp: record.updated_at,
        }
    }
}
