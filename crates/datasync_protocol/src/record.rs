//! Dataset records, sync snapshots and the diffs clients pull.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One record of a dataset as stored by the dataset handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Record identifier, unique within the dataset.
    pub uid: String,
    /// Record value.
    pub data: serde_json::Value,
}

impl DatasetRecord {
    /// Creates a record.
    pub fn new(uid: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            uid: uid.into(),
            data,
        }
    }
}

/// A hashed record value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Authoritative hash of `data`.
    pub hash: String,
    /// Record value.
    pub data: serde_json::Value,
}

/// The hashed contents of a dataset as seen by one sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Hash over all record hashes.
    pub dataset_hash: String,
    /// Records keyed by uid.
    pub records: BTreeMap<String, RecordEntry>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl SyncSnapshot {
    /// Returns the uid to hash map of the snapshot.
    pub fn hashes(&self) -> BTreeMap<String, String> {
        self.records
            .iter()
            .map(|(uid, entry)| (uid.clone(), entry.hash.clone()))
            .collect()
    }
}

/// Records added, changed or removed relative to a known uid to hash map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiff {
    /// Hash of the dataset the diff leads to.
    pub dataset_hash: String,
    /// Records missing from the known map.
    pub created: BTreeMap<String, RecordEntry>,
    /// Records whose hash differs from the known map.
    pub updated: BTreeMap<String, RecordEntry>,
    /// Known uids no longer in the dataset.
    pub deleted: BTreeSet<String>,
}

impl SyncDiff {
    /// Computes the diff that brings `known` to `snapshot`.
    pub fn compute(known: &BTreeMap<String, String>, snapshot: &SyncSnapshot) -> Self {
        let mut diff = Self {
            dataset_hash: snapshot.dataset_hash.clone(),
            ..Self::default()
        };
        for (uid, entry) in &snapshot.records {
            match known.get(uid) {
                None => {
                    diff.created.insert(uid.clone(), entry.clone());
                }
                Some(hash) if *hash != entry.hash => {
                    diff.updated.insert(uid.clone(), entry.clone());
                }
                Some(_) => {}
            }
        }
        diff.deleted = known
            .keys()
            .filter(|uid| !snapshot.records.contains_key(*uid))
            .cloned()
            .collect();
        diff
    }

    /// Drops every entry for the given uids.
    pub fn without(mut self, uids: &BTreeSet<String>) -> Self {
        self.created.retain(|uid, _| !uids.contains(uid));
        self.updated.retain(|uid, _| !uids.contains(uid));
        self.deleted.retain(|uid| !uids.contains(uid));
        self
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of changed records.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}
