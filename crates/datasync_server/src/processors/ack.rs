use crate::error::ServerResult;
use crate::storage::SyncStorage;
use datasync_backend::QueueItem;
use datasync_jobs::{JobResult, Processor};
use datasync_protocol::{AckJob, JobPayload};
use std::sync::Arc;
use tracing::debug;

/// Maintains the set of outcomes each client still has to receive, and
/// retires the bookkeeping of changes whose outcomes were acknowledged.
pub struct AckProcessor {
    storage: Arc<dyn SyncStorage>,
}

impl AckProcessor {
    /// Creates the processor.
    pub fn new(storage: Arc<dyn SyncStorage>) -> Self {
        Self { storage }
    }

    /// Publishes or retires outcomes. Retiring an absent outcome is a no-op.
    ///
    /// Submissions of an acknowledged change that are still unprocessed keep
    /// their bookkeeping.
    pub fn process_job(&self, job: &AckJob) -> ServerResult<()> {
        match job {
            AckJob::Publish(outcome) => {
                self.storage.save_outcome(outcome.clone())?;
                debug!(
                    dataset = %outcome.dataset_id,
                    client = %outcome.client_id,
                    hash = %outcome.hash,
                    "outcome published"
                );
            }
            AckJob::Acknowledge {
                dataset_id,
                client_id,
                hashes,
            } => {
                let mut retired = 0usize;
                let mut released = 0usize;
                for hash in hashes {
                    if self.storage.remove_outcome(dataset_id, client_id, hash)? {
                        retired += 1;
                    }
                    released += self.storage.remove_pending(dataset_id, client_id, hash)?;
                }
                debug!(
                    dataset = %dataset_id,
                    client = %client_id,
                    retired,
                    released,
                    "outcomes acknowledged"
                );
            }
        }
        Ok(())
    }
}

impl Processor for AckProcessor {
    fn process(&self, item: &QueueItem) -> JobResult<()> {
        let job = AckJob::from_payload(&item.payload)?;
        self.process_job(&job)?;
        Ok(())
    }
}
