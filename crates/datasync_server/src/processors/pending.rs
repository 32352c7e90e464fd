use crate::error::ServerResult;
use crate::handlers::{Dataset, Datasets};
use crate::hash::HashProvider;
use crate::storage::SyncStorage;
use datasync_backend::QueueItem;
use datasync_jobs::{Clock, DurableQueue, JobResult, Processor};
use datasync_protocol::{
    AckJob, Collision, DatasetRecord, JobPayload, PendingAction, PendingJob, PendingOutcome,
    PendingRecord, PendingStatus,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Applies client-submitted changes after an optimistic-concurrency check.
///
/// A change whose `pre_hash` matches the authoritative hash of its target is
/// applied through the dataset handlers. A mismatch is recorded as a
/// [`Collision`] and leaves the dataset untouched. Either outcome is
/// published on the ack queue.
pub struct PendingProcessor {
    clock: Arc<dyn Clock>,
    storage: Arc<dyn SyncStorage>,
    datasets: Arc<Datasets>,
    hasher: Arc<dyn HashProvider>,
    ack_queue: Arc<DurableQueue>,
}

impl PendingProcessor {
    /// Creates a processor that publishes outcomes on `ack_queue`.
    pub fn new(
        clock: Arc<dyn Clock>,
        storage: Arc<dyn SyncStorage>,
        datasets: Arc<Datasets>,
        hasher: Arc<dyn HashProvider>,
        ack_queue: Arc<DurableQueue>,
    ) -> Self {
        Self {
            clock,
            storage,
            datasets,
            hasher,
            ack_queue,
        }
    }

    /// Processes one change carried by queue item `job_id`, leased for the
    /// `attempt`-th time.
    ///
    /// Each submission keeps its own bookkeeping, so resubmitting a change
    /// that was already processed never overwrites the earlier outcome.
    pub fn process_job(
        &self,
        job: &PendingJob,
        job_id: &str,
        attempt: u32,
    ) -> ServerResult<PendingOutcome> {
        let dataset = self.datasets.resolve(&job.dataset_id);
        let change = &job.change;
        let meta = &job.meta_data;

        let existing = self.storage.get_pending(
            &job.dataset_id,
            &job.client_id,
            &change.hash,
            job_id,
        )?;
        if let Some(record) = existing.as_ref().filter(|r| r.processed_by(job_id)) {
            debug!(hash = %record.hash, job_id, "change already processed, republishing outcome");
            let current = dataset.handlers.read(&dataset.id, &record.uid, meta)?;
            let outcome = PendingOutcome::of(record, self.hash_of(current.as_ref()));
            self.publish(&outcome)?;
            return Ok(outcome);
        }
        let redelivered = attempt > 1;

        let now = self.clock.now();
        let mut record = PendingRecord::received(
            &job.dataset_id,
            &job.client_id,
            change,
            Some(job_id.to_string()),
            now,
        );
        self.storage.save_pending(record.clone())?;

        let current = dataset.handlers.read(&dataset.id, &change.uid, meta)?;
        let current_hash = self.hash_of(current.as_ref());

        let record_hash = if current_hash == change.pre_hash {
            let hash = self.apply(&dataset, &record, meta)?;
            record.transition(PendingStatus::Applied, self.clock.now());
            hash
        } else if redelivered && self.already_applied(&record, current_hash.as_deref()) {
            debug!(hash = %record.hash, "mutation landed before redelivery");
            record.transition(PendingStatus::Applied, self.clock.now());
            current_hash
        } else {
            let collision =
                Collision::from_pending(&record, current.map(|r| r.data), self.clock.now());
            dataset.handlers.handle_collision(collision, meta)?;
            record.transition(PendingStatus::Collision, self.clock.now());
            info!(
                dataset = %record.dataset_id,
                client = %record.client_id,
                uid = %record.uid,
                hash = %record.hash,
                "pending change collided"
            );
            current_hash
        };

        self.storage.save_pending(record.clone())?;
        let outcome = PendingOutcome::of(&record, record_hash);
        self.publish(&outcome)?;
        debug!(
            dataset = %record.dataset_id,
            uid = %record.uid,
            status = ?record.status,
            "pending change processed"
        );
        Ok(outcome)
    }

    fn apply(
        &self,
        dataset: &Dataset,
        record: &PendingRecord,
        meta: &serde_json::Value,
    ) -> ServerResult<Option<String>> {
        let handlers = &dataset.handlers;
        let written = match record.action {
            PendingAction::Create => {
                Some(handlers.create(&dataset.id, &record.uid, record.fields.clone(), meta)?)
            }
            PendingAction::Update => {
                Some(handlers.update(&dataset.id, &record.uid, record.fields.clone(), meta)?)
            }
            PendingAction::Delete => {
                handlers.delete(&dataset.id, &record.uid, meta)?;
                None
            }
        };
        Ok(self.hash_of(written.as_ref()))
    }

    fn already_applied(&self, record: &PendingRecord, current_hash: Option<&str>) -> bool {
        match record.action {
            PendingAction::Delete => current_hash.is_none(),
            _ => current_hash == Some(self.hasher.compute_hash(&record.fields).as_str()),
        }
    }

    fn hash_of(&self, record: Option<&DatasetRecord>) -> Option<String> {
        record.map(|r| self.hasher.compute_hash(&r.data))
    }

    fn publish(&self, outcome: &PendingOutcome) -> ServerResult<()> {
        self.ack_queue.add_job(&AckJob::Publish(outcome.clone()))?;
        Ok(())
    }
}

impl Processor for PendingProcessor {
    fn process(&self, item: &QueueItem) -> JobResult<()> {
        let job = PendingJob::from_payload(&item.payload)?;
        self.process_job(&job, &item.id, item.attempts)?;
        Ok(())
    }
}
