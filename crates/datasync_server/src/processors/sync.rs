use crate::error::ServerResult;
use crate::handlers::Datasets;
use crate::hash::HashProvider;
use crate::storage::SyncStorage;
use datasync_backend::QueueItem;
use datasync_jobs::{Clock, JobResult, Processor};
use datasync_protocol::{
    JobPayload, RecordEntry, RegistrationFilter, RegistrationPatch, SyncDiff, SyncJob,
    SyncSnapshot,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Recomputes what one client registration must pull.
///
/// Lists the dataset with the registration's query, hashes every record,
/// and stores the diff against the previous snapshot together with the new
/// snapshot. Pending bookkeeping is never touched.
pub struct SyncProcessor {
    clock: Arc<dyn Clock>,
    storage: Arc<dyn SyncStorage>,
    datasets: Arc<Datasets>,
    hasher: Arc<dyn HashProvider>,
}

impl SyncProcessor {
    /// Creates the processor.
    pub fn new(
        clock: Arc<dyn Clock>,
        storage: Arc<dyn SyncStorage>,
        datasets: Arc<Datasets>,
        hasher: Arc<dyn HashProvider>,
    ) -> Self {
        Self {
            clock,
            storage,
            datasets,
            hasher,
        }
    }

    /// Takes a snapshot for the job's registration and returns the diff
    /// against the previous one.
    pub fn process_job(&self, job: &SyncJob) -> ServerResult<SyncDiff> {
        let dataset = self.datasets.resolve(&job.dataset_id);
        let records = dataset
            .handlers
            .list(&dataset.id, &job.query_params, &job.meta_data)?;

        let entries: BTreeMap<String, RecordEntry> = records
            .into_iter()
            .map(|record| {
                let entry = RecordEntry {
                    hash: self.hasher.compute_hash(&record.data),
                    data: record.data,
                };
                (record.uid, entry)
            })
            .collect();
        let hashes: Vec<String> = entries.values().map(|e| e.hash.clone()).collect();
        let now = self.clock.now();
        let snapshot = SyncSnapshot {
            dataset_hash: self.hasher.dataset_hash(&hashes),
            records: entries,
            taken_at: now,
        };

        let known = self
            .storage
            .get_snapshot(&job.dataset_id, &job.client_id)?
            .map(|previous| previous.hashes())
            .unwrap_or_default();
        let diff = SyncDiff::compute(&known, &snapshot);

        let dataset_hash = snapshot.dataset_hash.clone();
        self.storage
            .save_diff(&job.dataset_id, &job.client_id, diff.clone())?;
        self.storage
            .save_snapshot(&job.dataset_id, &job.client_id, snapshot)?;
        self.storage.update_registrations(
            &RegistrationFilter::pair(&job.dataset_id, &job.client_id),
            &RegistrationPatch::processed(now, dataset_hash.as_str()),
        )?;

        debug!(
            dataset = %job.dataset_id,
            client = %job.client_id,
            hash = %dataset_hash,
            changes = diff.len(),
            "sync pass complete"
        );
        Ok(diff)
    }
}

impl Processor for SyncProcessor {
    fn process(&self, item: &QueueItem) -> JobResult<()> {
        let job = SyncJob::from_payload(&item.payload)?;
        self.process_job(&job)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::fixture::Fixture;
    use crate::DatasetHandlers;
    use datasync_protocol::DatasetClientRegistration;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn processor(f: &Fixture) -> SyncProcessor {
        SyncProcessor::new(
            f.clock.clone(),
            f.storage.clone(),
            f.datasets.clone(),
            f.hasher.clone(),
        )
    }

    fn job() -> SyncJob {
        SyncJob {
            dataset_id: "todos".into(),
            client_id: "device-1".into(),
            query_params: Value::Null,
            meta_data: Value::Null,
        }
    }

    #[test]
    fn first_pass_creates_everything() {
        let f = Fixture::new();
        f.handlers.create("todos", "u1", json!({"n": 1}), &Value::Null).unwrap();
        f.handlers.create("todos", "u2", json!({"n": 2}), &Value::Null).unwrap();

        let diff = processor(&f).process_job(&job()).unwrap();
        assert_eq!(diff.created.len(), 2);
        assert!(diff.updated.is_empty() && diff.deleted.is_empty());

        let snapshot = f.storage.get_snapshot("todos", "device-1").unwrap().unwrap();
        assert_eq!(snapshot.dataset_hash, diff.dataset_hash);
        assert_eq!(f.storage.get_diff("todos", "device-1").unwrap(), Some(diff));
    }

    #[test]
    fn later_pass_reports_changes() {
        let f = Fixture::new();
        let p = processor(&f);
        f.handlers.create("todos", "u1", json!({"n": 1}), &Value::Null).unwrap();
        f.handlers.create("todos", "u2", json!({"n": 2}), &Value::Null).unwrap();
        let first = p.process_job(&job()).unwrap();

        f.handlers.update("todos", "u1", json!({"n": 10}), &Value::Null).unwrap();
        f.handlers.delete("todos", "u2", &Value::Null).unwrap();
        f.handlers.create("todos", "u3", json!({"n": 3}), &Value::Null).unwrap();
        let diff = p.process_job(&job()).unwrap();

        assert!(diff.created.contains_key("u3"));
        assert!(diff.updated.contains_key("u1"));
        assert!(diff.deleted.contains("u2"));
        assert_ne!(diff.dataset_hash, first.dataset_hash);

        let unchanged = p.process_job(&job()).unwrap();
        assert!(unchanged.is_empty());
        assert_eq!(unchanged.dataset_hash, diff.dataset_hash);
    }

    #[test]
    fn checkpoint_is_recorded() {
        let f = Fixture::new();
        f.storage
            .upsert_registration(DatasetClientRegistration::new(
                "todos",
                "device-1",
                Duration::from_secs(10),
                f.clock.now(),
            ))
            .unwrap();

        let diff = processor(&f).process_job(&job()).unwrap();
        let registration = f
            .storage
            .get_registrations(&RegistrationFilter::pair("todos", "device-1"))
            .unwrap()
            .remove(0);
        assert_eq!(registration.global_hash, Some(diff.dataset_hash));
        assert_eq!(registration.last_processed_at, Some(f.clock.now()));
    }

    #[test]
    fn processes_queue_items() {
        let f = Fixture::new();
        f.handlers.create("todos", "u1", json!({}), &Value::Null).unwrap();
        let item = f.lease(&job());
        processor(&f).process(&item).unwrap();
        assert!(f.storage.get_snapshot("todos", "device-1").unwrap().is_some());
    }
}
