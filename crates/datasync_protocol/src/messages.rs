//! Client request and response messages.

use crate::pending::{PendingChange, PendingOutcome};
use crate::record::{RecordEntry, SyncDiff};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A client's periodic sync call for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Calling client.
    pub client_id: String,
    /// Query parameters the client lists the dataset with.
    #[serde(default)]
    pub query_params: serde_json::Value,
    /// Opaque metadata forwarded to dataset handlers.
    #[serde(default)]
    pub meta_data: serde_json::Value,
    /// Changes made on the client since its last sync.
    #[serde(default)]
    pub pending: Vec<PendingChange>,
    /// Change identifiers whose outcomes the client received.
    #[serde(default)]
    pub acknowledgements: Vec<String>,
}

impl SyncRequest {
    /// Creates an empty request for a client.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Adds a pending change.
    pub fn with_pending(mut self, change: PendingChange) -> Self {
        self.pending.push(change);
        self
    }

    /// Adds an acknowledgement.
    pub fn with_acknowledgement(mut self, hash: impl Into<String>) -> Self {
        self.acknowledgements.push(hash.into());
        self
    }

    /// Sets the query parameters.
    pub fn with_query_params(mut self, query_params: serde_json::Value) -> Self {
        self.query_params = query_params;
        self
    }
}

/// Answer to a [`SyncRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Last dataset hash computed for the client, if any sync pass ran.
    pub hash: Option<String>,
    /// Outcomes of earlier changes awaiting acknowledgement.
    pub updates: Vec<PendingOutcome>,
}

/// A client's request for the records it is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecordsRequest {
    /// Calling client.
    pub client_id: String,
    /// Query parameters the client lists the dataset with.
    #[serde(default)]
    pub query_params: serde_json::Value,
    /// Opaque metadata forwarded to dataset handlers.
    #[serde(default)]
    pub meta_data: serde_json::Value,
    /// uid to hash map of the records the client holds.
    #[serde(default)]
    pub known: BTreeMap<String, String>,
}

/// Records the client must create, update or delete locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecordsResponse {
    /// Dataset hash the records lead to.
    pub hash: Option<String>,
    /// Records the client lacks.
    pub create: BTreeMap<String, RecordEntry>,
    /// Records the client holds with a stale hash.
    pub update: BTreeMap<String, RecordEntry>,
    /// Records the client holds that no longer exist.
    pub delete: BTreeSet<String>,
}

impl From<SyncDiff> for SyncRecordsResponse {
    fn from(diff: SyncDiff) -> Self {
        Self {
            hash: Some(diff.dataset_hash),
            create: diff.created,
            update: diff.updated,
            delete: diff.deleted,
        }
    }
}
