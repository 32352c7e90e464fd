//! Durable queue with lease-based delivery.

use crate::clock::{add_duration, sub_duration, Clock};
use crate::config::QueueConfig;
use crate::error::JobResult;
use crate::task::{shutdown_requested, BackgroundTask, Shutdown};
use datasync_backend::{ItemState, QueueBackend, QueueItem, QueueStats};
use datasync_protocol::JobPayload;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A named durable queue.
///
/// Items are leased rather than removed: [`DurableQueue::get`] hides an item
/// for a visibility timeout, and an item whose lease expires without an
/// [`DurableQueue::ack`] becomes leasable again. Delivery is therefore
/// at-least-once and processors must be idempotent.
///
/// Every method except the prune job talks to the backend synchronously and
/// surfaces backend errors to the caller without retrying.
pub struct DurableQueue {
    name: String,
    backend: Arc<dyn QueueBackend>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    prune_job: Mutex<Option<BackgroundTask>>,
}

impl DurableQueue {
    /// Creates a handle for queue `name`. Call [`DurableQueue::create`]
    /// before first use.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            clock,
            config,
            prune_job: Mutex::new(None),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ensures the backing storage exists. Idempotent.
    pub fn create(&self) -> JobResult<()> {
        self.backend.ensure_queue(&self.name)?;
        debug!(queue = %self.name, "queue ready");
        Ok(())
    }

    /// Enqueues a payload and returns the new item id.
    pub fn add(&self, payload: serde_json::Value) -> JobResult<String> {
        let id = Uuid::new_v4().to_string();
        let item = QueueItem::new(id.clone(), self.name.clone(), payload, self.clock.now());
        self.backend.insert(item)?;
        debug!(queue = %self.name, item_id = %id, "item added");
        Ok(id)
    }

    /// Encodes and enqueues a job.
    pub fn add_job<J: JobPayload>(&self, job: &J) -> JobResult<String> {
        self.add(job.to_payload()?)
    }

    /// Leases the oldest leasable item, hiding it for `visibility_timeout`.
    ///
    /// Returns `None` if nothing is leasable.
    pub fn get(&self, visibility_timeout: Duration) -> JobResult<Option<QueueItem>> {
        let now = self.clock.now();
        let leased =
            self.backend
                .lease_next(&self.name, now, add_duration(now, visibility_timeout))?;
        if let Some(item) = &leased {
            debug!(
                queue = %self.name,
                item_id = %item.id,
                attempts = item.attempts,
                "item leased"
            );
        }
        Ok(leased)
    }

    /// Marks an item `done`. Acking a missing or terminal item is a no-op.
    pub fn ack(&self, id: &str) -> JobResult<()> {
        self.finish(id, ItemState::Done)
    }

    /// Marks an item `failed` and leaves it for inspection. Idempotent.
    pub fn fail(&self, id: &str) -> JobResult<()> {
        self.finish(id, ItemState::Failed)
    }

    fn finish(&self, id: &str, state: ItemState) -> JobResult<()> {
        let changed = self
            .backend
            .complete(&self.name, id, state, self.clock.now())?;
        if changed {
            debug!(queue = %self.name, item_id = %id, state = state.as_str(), "item finished");
        }
        Ok(())
    }

    /// Reads one item.
    pub fn item(&self, id: &str) -> JobResult<Option<QueueItem>> {
        Ok(self.backend.item(&self.name, id)?)
    }

    /// Counts items per state.
    pub fn stats(&self) -> JobResult<QueueStats> {
        Ok(self.backend.stats(&self.name)?)
    }

    /// Runs one prune pass and returns the number of deleted items.
    pub fn prune(&self) -> JobResult<u64> {
        prune_once(
            self.backend.as_ref(),
            &self.name,
            self.clock.as_ref(),
            self.config.retention,
        )
    }

    /// Starts the periodic prune job. No-op if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_prune_job(&self, run_immediately: bool) {
        let mut slot = self.prune_job.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let backend = Arc::clone(&self.backend);
        let clock = Arc::clone(&self.clock);
        let name = self.name.clone();
        let config = self.config.clone();
        *slot = Some(BackgroundTask::spawn(
            format!("{}:prune", self.name),
            move |shutdown| prune_loop(backend, clock, name, config, run_immediately, shutdown),
        ));
        info!(queue = %self.name, "prune job started");
    }

    /// Stops the prune job and waits for a running pass to finish.
    pub async fn stop_prune_job(&self) {
        let task = self.prune_job.lock().take();
        if let Some(task) = task {
            task.stop().await;
            info!(queue = %self.name, "prune job stopped");
        }
    }

    /// Returns true while the prune job runs.
    pub fn is_pruning(&self) -> bool {
        self.prune_job
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

fn prune_once(
    backend: &dyn QueueBackend,
    queue: &str,
    clock: &dyn Clock,
    retention: Duration,
) -> JobResult<u64> {
    let removed = backend.prune(queue, sub_duration(clock.now(), retention))?;
    if removed > 0 {
        debug!(queue = %queue, removed, "pruned terminal items");
    }
    Ok(removed)
}

async fn prune_loop(
    backend: Arc<dyn QueueBackend>,
    clock: Arc<dyn Clock>,
    name: String,
    config: QueueConfig,
    run_immediately: bool,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(config.prune_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !run_immediately {
        // The first tick of an interval completes at once.
        ticker.tick().await;
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if shutdown_requested(&shutdown) {
            break;
        }

        let backend = Arc::clone(&backend);
        let clock = Arc::clone(&clock);
        let queue = name.clone();
        let retention = config.retention;
        let pass = tokio::task::spawn_blocking(move || {
            prune_once(backend.as_ref(), &queue, clock.as_ref(), retention)
        })
        .await;
        match pass {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(queue = %name, error = %e, "prune pass failed"),
            Err(e) => warn!(queue = %name, error = %e, "prune pass panicked"),
        }
    }
}
