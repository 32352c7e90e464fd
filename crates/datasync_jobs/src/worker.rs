//! Polling workers.

use crate::config::WorkerConfig;
use crate::error::JobResult;
use crate::queue::DurableQueue;
use crate::task::{sleep_or_shutdown, shutdown_requested, BackgroundTask, Shutdown};
use datasync_backend::QueueItem;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Domain logic invoked for each leased queue item.
///
/// Processors run on a blocking thread. They must be idempotent: an item is
/// delivered again when its lease expires before it is acked.
pub trait Processor: Send + Sync {
    /// Processes one item. An error leaves the item for another attempt,
    /// unless it is not retryable.
    fn process(&self, item: &QueueItem) -> JobResult<()>;
}

impl<F> Processor for F
where
    F: Fn(&QueueItem) -> JobResult<()> + Send + Sync,
{
    fn process(&self, item: &QueueItem) -> JobResult<()> {
        self(item)
    }
}

/// What one lease-process-ack cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was leasable.
    Idle,
    /// An item was processed and acked.
    Processed,
    /// Processing failed; the lease is left to expire.
    Retrying,
    /// Processing failed for good; the item was marked `failed`.
    Failed,
}

impl CycleOutcome {
    /// Returns true if an item was leased.
    pub fn leased(&self) -> bool {
        !matches!(self, CycleOutcome::Idle)
    }
}

struct WorkerCore {
    name: String,
    queue: Arc<DurableQueue>,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
}

impl WorkerCore {
    fn run_once(&self) -> JobResult<CycleOutcome> {
        let Some(item) = self.queue.get(self.config.visibility_timeout)? else {
            return Ok(CycleOutcome::Idle);
        };

        match self.processor.process(&item) {
            Ok(()) => {
                self.queue.ack(&item.id)?;
                debug!(worker = %self.name, item_id = %item.id, "item processed");
                Ok(CycleOutcome::Processed)
            }
            Err(e) if !e.is_retryable() || item.attempts >= self.config.max_attempts => {
                warn!(
                    worker = %self.name,
                    item_id = %item.id,
                    attempts = item.attempts,
                    error = %e,
                    "giving up on item"
                );
                self.queue.fail(&item.id)?;
                Ok(CycleOutcome::Failed)
            }
            Err(e) => {
                warn!(
                    worker = %self.name,
                    item_id = %item.id,
                    attempts = item.attempts,
                    error = %e,
                    "processing failed, will retry after lease expiry"
                );
                Ok(CycleOutcome::Retrying)
            }
        }
    }
}

/// Leases items from one queue and hands them to one processor.
///
/// A worker runs at most one cycle at a time. After a cycle that leased an
/// item the next cycle starts right away; after an idle poll or a queue error
/// the worker waits `interval`.
pub struct PollingWorker {
    core: Arc<WorkerCore>,
    task: Mutex<Option<BackgroundTask>>,
}

impl PollingWorker {
    /// Creates a stopped worker.
    pub fn new(
        name: impl Into<String>,
        queue: Arc<DurableQueue>,
        processor: Arc<dyn Processor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            core: Arc::new(WorkerCore {
                name: name.into(),
                queue,
                processor,
                config,
            }),
            task: Mutex::new(None),
        }
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The queue this worker drains.
    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.core.queue
    }

    /// Runs a single cycle on the calling thread.
    pub fn run_once(&self) -> JobResult<CycleOutcome> {
        self.core.run_once()
    }

    /// Starts the polling loop. No-op if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn work(&self) {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let core = Arc::clone(&self.core);
        *slot = Some(BackgroundTask::spawn(self.core.name.clone(), move |shutdown| {
            poll_loop(core, shutdown)
        }));
        info!(worker = %self.core.name, queue = %self.core.queue.name(), "worker started");
    }

    /// Stops the loop. Returns once no processor call is in flight.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
            info!(worker = %self.core.name, "worker stopped");
        }
    }

    /// Returns true while the loop runs.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl std::fmt::Debug for PollingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWorker")
            .field("name", &self.core.name)
            .field("queue", &self.core.queue.name())
            .field("config", &self.core.config)
            .finish()
    }
}

async fn poll_loop(core: Arc<WorkerCore>, mut shutdown: Shutdown) {
    let interval = core.config.interval;
    loop {
        if shutdown_requested(&shutdown) {
            break;
        }

        let cycle = Arc::clone(&core);
        let outcome = tokio::task::spawn_blocking(move || cycle.run_once()).await;
        let wait = match outcome {
            Ok(Ok(outcome)) if outcome.leased() => Duration::ZERO,
            Ok(Ok(_)) => interval,
            Ok(Err(e)) => {
                warn!(worker = %core.name, error = %e, "worker cycle failed");
                interval
            }
            Err(e) => {
                warn!(worker = %core.name, error = %e, "worker cycle panicked");
                interval
            }
        };

        if wait.is_zero() {
            tokio::task::yield_now().await;
        } else if sleep_or_shutdown(&mut shutdown, wait).await {
            break;
        }
    }
}
