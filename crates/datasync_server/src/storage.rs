//! Storage of registrations, pending bookkeeping and sync checkpoints.

use crate::error::{ServerError, ServerResult};
use datasync_protocol::{
    DatasetClientRegistration, PendingOutcome, PendingRecord, RegistrationFilter,
    RegistrationPatch, SyncDiff, SyncSnapshot,
};
use parking_lot::RwLock;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Storage shared by every component and every server process.
///
/// Each method must be atomic on its own; callers never hold in-process
/// locks across calls.
pub trait SyncStorage: Send + Sync {
    /// Registrations selected by `filter`.
    fn get_registrations(
        &self,
        filter: &RegistrationFilter,
    ) -> ServerResult<Vec<DatasetClientRegistration>>;

    /// Inserts a registration, or refreshes the query parameters and metadata
    /// of an existing one. Returns the stored registration.
    fn upsert_registration(
        &self,
        registration: DatasetClientRegistration,
    ) -> ServerResult<DatasetClientRegistration>;

    /// Applies `patch` to every registration selected by `filter` and
    /// returns how many were updated.
    fn update_registrations(
        &self,
        filter: &RegistrationFilter,
        patch: &RegistrationPatch,
    ) -> ServerResult<usize>;

    /// Reads the bookkeeping of change `hash` as submitted in queue item
    /// `job_id`.
    fn get_pending(
        &self,
        dataset_id: &str,
        client_id: &str,
        hash: &str,
        job_id: &str,
    ) -> ServerResult<Option<PendingRecord>>;

    /// Stores the bookkeeping for one submission of a change, keyed by the
    /// change hash and the queue item that carries it.
    fn save_pending(&self, record: PendingRecord) -> ServerResult<()>;

    /// Stores `record` unless the submission already has bookkeeping.
    /// Returns false if it was left untouched.
    fn insert_pending(&self, record: PendingRecord) -> ServerResult<bool>;

    /// Every submission a client made for a dataset.
    fn list_pending(&self, dataset_id: &str, client_id: &str) -> ServerResult<Vec<PendingRecord>>;

    /// Deletes the processed submissions of change `hash`. Submissions not
    /// processed yet are kept. Returns how many were deleted.
    fn remove_pending(&self, dataset_id: &str, client_id: &str, hash: &str)
        -> ServerResult<usize>;

    /// Makes an outcome deliverable. Outcomes are keyed by change hash and
    /// queue item, so saving the same outcome twice keeps one.
    fn save_outcome(&self, outcome: PendingOutcome) -> ServerResult<()>;

    /// Outcomes awaiting acknowledgement by a client.
    fn list_outcomes(&self, dataset_id: &str, client_id: &str)
        -> ServerResult<Vec<PendingOutcome>>;

    /// Retires every outcome of change `hash`. Returns false if there was none.
    fn remove_outcome(&self, dataset_id: &str, client_id: &str, hash: &str) -> ServerResult<bool>;

    /// Last snapshot taken for a registration.
    fn get_snapshot(&self, dataset_id: &str, client_id: &str)
        -> ServerResult<Option<SyncSnapshot>>;

    /// Replaces the snapshot of a registration.
    fn save_snapshot(
        &self,
        dataset_id: &str,
        client_id: &str,
        snapshot: SyncSnapshot,
    ) -> ServerResult<()>;

    /// Last diff computed for a registration.
    fn get_diff(&self, dataset_id: &str, client_id: &str) -> ServerResult<Option<SyncDiff>>;

    /// Replaces the diff of a registration.
    fn save_diff(&self, dataset_id: &str, client_id: &str, diff: SyncDiff) -> ServerResult<()>;
}

type ClientKey = (String, String);
type SubmissionKey = (String, String, String, String);

fn client_key(dataset_id: &str, client_id: &str) -> ClientKey {
    (dataset_id.to_string(), client_id.to_string())
}

fn submission_key(dataset_id: &str, client_id: &str, hash: &str, job_id: &str) -> SubmissionKey {
    (
        dataset_id.to_string(),
        client_id.to_string(),
        hash.to_string(),
        job_id.to_string(),
    )
}

fn record_key(record: &PendingRecord) -> SubmissionKey {
    submission_key(
        &record.dataset_id,
        &record.client_id,
        &record.hash,
        record.job_id.as_deref().unwrap_or_default(),
    )
}

fn outcome_key(outcome: &PendingOutcome) -> SubmissionKey {
    submission_key(
        &outcome.dataset_id,
        &outcome.client_id,
        &outcome.hash,
        outcome.job_id.as_deref().unwrap_or_default(),
    )
}

fn same_change(key: &SubmissionKey, dataset_id: &str, client_id: &str, hash: &str) -> bool {
    key.0 == dataset_id && key.1 == client_id && key.2 == hash
}

#[derive(Debug, Default)]
struct Tables {
    registrations: BTreeMap<String, DatasetClientRegistration>,
    pending: BTreeMap<SubmissionKey, PendingRecord>,
    outcomes: BTreeMap<SubmissionKey, PendingOutcome>,
    snapshots: BTreeMap<ClientKey, SyncSnapshot>,
    diffs: BTreeMap<ClientKey, SyncDiff>,
}

/// In-memory [`SyncStorage`].
///
/// Sharing one instance through an `Arc` models several server processes
/// sharing one store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> ServerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServerError::StorageUnavailable(
                "memory storage marked unavailable".into(),
            ));
        }
        Ok(())
    }
}

impl SyncStorage for MemoryStorage {
    fn get_registrations(
        &self,
        filter: &RegistrationFilter,
    ) -> ServerResult<Vec<DatasetClientRegistration>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .registrations
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn upsert_registration(
        &self,
        registration: DatasetClientRegistration,
    ) -> ServerResult<DatasetClientRegistration> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let stored = tables
            .registrations
            .entry(registration.id.clone())
            .and_modify(|existing| {
                existing.query_params = registration.query_params.clone();
                existing.meta_data = registration.meta_data.clone();
            })
            .or_insert(registration);
        Ok(stored.clone())
    }

    fn update_registrations(
        &self,
        filter: &RegistrationFilter,
        patch: &RegistrationPatch,
    ) -> ServerResult<usize> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let mut updated = 0;
        for registration in tables.registrations.values_mut() {
            if filter.matches(registration) {
                patch.apply(registration);
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn get_pending(
        &self,
        dataset_id: &str,
        client_id: &str,
        hash: &str,
        job_id: &str,
    ) -> ServerResult<Option<PendingRecord>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .pending
            .get(&submission_key(dataset_id, client_id, hash, job_id))
            .cloned())
    }

    fn save_pending(&self, record: PendingRecord) -> ServerResult<()> {
        self.check_available()?;
        self.tables.write().pending.insert(record_key(&record), record);
        Ok(())
    }

    fn insert_pending(&self, record: PendingRecord) -> ServerResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.write();
        match tables.pending.entry(record_key(&record)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    fn list_pending(&self, dataset_id: &str, client_id: &str) -> ServerResult<Vec<PendingRecord>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .pending
            .values()
            .filter(|r| r.dataset_id == dataset_id && r.client_id == client_id)
            .cloned()
            .collect())
    }

    fn remove_pending(
        &self,
        dataset_id: &str,
        client_id: &str,
        hash: &str,
    ) -> ServerResult<usize> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let before = tables.pending.len();
        tables.pending.retain(|key, record| {
            !(same_change(key, dataset_id, client_id, hash) && record.status.is_terminal())
        });
        Ok(before - tables.pending.len())
    }

    fn save_outcome(&self, outcome: PendingOutcome) -> ServerResult<()> {
        self.check_available()?;
        self.tables.write().outcomes.insert(outcome_key(&outcome), outcome);
        Ok(())
    }

    fn list_outcomes(
        &self,
        dataset_id: &str,
        client_id: &str,
    ) -> ServerResult<Vec<PendingOutcome>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .outcomes
            .values()
            .filter(|o| o.dataset_id == dataset_id && o.client_id == client_id)
            .cloned()
            .collect())
    }

    fn remove_outcome(&self, dataset_id: &str, client_id: &str, hash: &str) -> ServerResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let before = tables.outcomes.len();
        tables
            .outcomes
            .retain(|key, _| !same_change(key, dataset_id, client_id, hash));
        Ok(tables.outcomes.len() < before)
    }

    fn get_snapshot(
        &self,
        dataset_id: &str,
        client_id: &str,
    ) -> ServerResult<Option<SyncSnapshot>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .snapshots
            .get(&client_key(dataset_id, client_id))
            .cloned())
    }

    fn save_snapshot(
        &self,
        dataset_id: &str,
        client_id: &str,
        snapshot: SyncSnapshot,
    ) -> ServerResult<()> {
        self.check_available()?;
        self.tables
            .write()
            .snapshots
            .insert(client_key(dataset_id, client_id), snapshot);
        Ok(())
    }

    fn get_diff(&self, dataset_id: &str, client_id: &str) -> ServerResult<Option<SyncDiff>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .diffs
            .get(&client_key(dataset_id, client_id))
            .cloned())
    }

    fn save_diff(&self, dataset_id: &str, client_id: &str, diff: SyncDiff) -> ServerResult<()> {
        self.check_available()?;
        self.tables
            .write()
            .diffs
            .insert(client_key(dataset_id, client_id), diff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use datasync_protocol::{PendingAction, PendingChange, PendingStatus};
    use serde_json::json;
    use std::time::Duration;

    fn registration(dataset: &str, client: &str) -> DatasetClientRegistration {
        DatasetClientRegistration::new(dataset, client, Duration::from_secs(10), Utc::now())
    }

    #[test]
    fn upsert_keeps_scheduling_state() {
        let storage = MemoryStorage::new();
        storage.upsert_registration(registration("todos", "a")).unwrap();
        storage
            .update_registrations(
                &RegistrationFilter::pair("todos", "a"),
                &RegistrationPatch::stopped(true),
            )
            .unwrap();

        let refreshed = storage
            .upsert_registration(registration("todos", "a").with_query_params(json!({"done": false})))
            .unwrap();
        assert!(refreshed.stopped);
        assert_eq!(refreshed.query_params, json!({"done": false}));
        assert_eq!(storage.get_registrations(&RegistrationFilter::all()).unwrap().len(), 1);
    }

    #[test]
    fn update_by_filter() {
        let storage = MemoryStorage::new();
        storage.upsert_registration(registration("todos", "a")).unwrap();
        storage.upsert_registration(registration("todos", "b")).unwrap();
        storage.upsert_registration(registration("notes", "a")).unwrap();

        let n = storage
            .update_registrations(
                &RegistrationFilter::dataset("todos"),
                &RegistrationPatch::stopped(true),
            )
            .unwrap();
        assert_eq!(n, 2);
        let active = storage.get_registrations(&RegistrationFilter::active()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].dataset_id, "notes");
    }

    fn submission(job_id: &str, status: PendingStatus) -> PendingRecord {
        let change = PendingChange {
            hash: "c1".into(),
            uid: "u1".into(),
            action: PendingAction::Create,
            pre_hash: None,
            post_hash: None,
            post: Some(json!({})),
        };
        let mut record =
            PendingRecord::received("todos", "a", &change, Some(job_id.into()), Utc::now());
        record.transition(status, Utc::now());
        record
    }

    #[test]
    fn outcomes_are_keyed_by_submission() {
        let storage = MemoryStorage::new();
        let first = PendingOutcome::of(&submission("item-1", PendingStatus::Applied), None);
        let second = PendingOutcome::of(&submission("item-2", PendingStatus::Collision), None);

        storage.save_outcome(first.clone()).unwrap();
        storage.save_outcome(first).unwrap();
        storage.save_outcome(second).unwrap();
        assert_eq!(storage.list_outcomes("todos", "a").unwrap().len(), 2);
        assert!(storage.list_outcomes("todos", "b").unwrap().is_empty());

        assert!(storage.remove_outcome("todos", "a", "c1").unwrap());
        assert!(storage.list_outcomes("todos", "a").unwrap().is_empty());
        assert!(!storage.remove_outcome("todos", "a", "c1").unwrap());
    }

    #[test]
    fn insert_pending_keeps_existing_bookkeeping() {
        let storage = MemoryStorage::new();
        storage
            .save_pending(submission("item-1", PendingStatus::Applied))
            .unwrap();

        assert!(!storage
            .insert_pending(submission("item-1", PendingStatus::Clean))
            .unwrap());
        let stored = storage.get_pending("todos", "a", "c1", "item-1").unwrap().unwrap();
        assert_eq!(stored.status, PendingStatus::Applied);

        assert!(storage
            .insert_pending(submission("item-2", PendingStatus::Clean))
            .unwrap());
        assert_eq!(storage.list_pending("todos", "a").unwrap().len(), 2);
    }

    #[test]
    fn remove_pending_keeps_unprocessed_submissions() {
        let storage = MemoryStorage::new();
        storage
            .save_pending(submission("item-1", PendingStatus::Applied))
            .unwrap();
        storage
            .save_pending(submission("item-2", PendingStatus::Collision))
            .unwrap();
        storage
            .save_pending(submission("item-3", PendingStatus::Clean))
            .unwrap();

        assert_eq!(storage.remove_pending("todos", "a", "c1").unwrap(), 2);
        assert_eq!(storage.remove_pending("todos", "a", "c1").unwrap(), 0);
        let left = storage.list_pending("todos", "a").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status, PendingStatus::Clean);
    }

    #[test]
    fn unavailable_storage_fails() {
        let storage = MemoryStorage::new();
        storage.set_available(false);
        let err = storage.get_registrations(&RegistrationFilter::all()).unwrap_err();
        assert!(matches!(err, ServerError::StorageUnavailable(_)));
        storage.set_available(true);
        assert!(storage.get_registrations(&RegistrationFilter::all()).is_ok());
    }
}
