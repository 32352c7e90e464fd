//! Cluster-wide sync scheduling.
//!
//! Every server process runs a scheduler, but each tick first takes the
//! scheduler lock, so only one process enqueues sync jobs per tick.

use crate::error::ServerResult;
use crate::storage::SyncStorage;
use chrono::{DateTime, Utc};
use datasync_jobs::{
    shutdown_requested, BackgroundTask, Clock, DistributedLock, DurableQueue, LockHandle, Shutdown,
};
use datasync_protocol::{
    DatasetClientRegistration, RegistrationFilter, RegistrationPatch, SyncJob,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// When an active registration gets a sync job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DuePolicy {
    /// Once its sync frequency has elapsed since it was last scheduled.
    #[default]
    Frequency,
    /// On every tick.
    EveryTick,
}

impl DuePolicy {
    /// Returns true if `registration` should be scheduled at `now`.
    pub fn is_due(self, registration: &DatasetClientRegistration, now: DateTime<Utc>) -> bool {
        match self {
            DuePolicy::Frequency => registration.is_due(now),
            DuePolicy::EveryTick => !registration.stopped,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Name of the lock guarding each tick.
    pub lock_name: String,
    /// Time between two ticks.
    pub interval: Duration,
    /// Maximum hold time of the lock, after which a silent holder is
    /// assumed to have crashed.
    pub lock_max_time: Duration,
    /// Due-check policy.
    pub due_policy: DuePolicy,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// Another process holds the lock.
    Skipped,
    /// This process scheduled.
    Ran {
        /// Active registrations examined.
        registrations: usize,
        /// Sync jobs enqueued.
        enqueued: usize,
    },
}

struct SchedulerCore {
    config: SchedulerConfig,
    lock: DistributedLock,
    storage: Arc<dyn SyncStorage>,
    sync_queue: Arc<DurableQueue>,
    clock: Arc<dyn Clock>,
}

impl SchedulerCore {
    fn tick(&self) -> ServerResult<TickReport> {
        let Some(mut handle) = self
            .lock
            .acquire(&self.config.lock_name, self.config.lock_max_time)?
        else {
            debug!(lock = %self.config.lock_name, "scheduler lock held elsewhere, skipping tick");
            return Ok(TickReport::Skipped);
        };

        let result = self.schedule(&mut handle);
        if let Err(e) = self.lock.release(&handle) {
            warn!(lock = %self.config.lock_name, error = %e, "failed to release scheduler lock");
        }
        result
    }

    fn schedule(&self, handle: &mut LockHandle) -> ServerResult<TickReport> {
        let registrations = self
            .storage
            .get_registrations(&RegistrationFilter::active())?;

        let mut enqueued = 0;
        for registration in &registrations {
            let now = self.clock.now();
            if handle.should_renew(now) && !self.lock.renew(handle)? {
                warn!(lock = %self.config.lock_name, "scheduler lock lost mid-tick");
                break;
            }
            if !self.config.due_policy.is_due(registration, now) {
                continue;
            }

            self.sync_queue.add_job(&SyncJob {
                dataset_id: registration.dataset_id.clone(),
                client_id: registration.client_id.clone(),
                query_params: registration.query_params.clone(),
                meta_data: registration.meta_data.clone(),
            })?;
            self.storage.update_registrations(
                &RegistrationFilter::pair(&registration.dataset_id, &registration.client_id),
                &RegistrationPatch::scheduled(now),
            )?;
            enqueued += 1;
        }

        Ok(TickReport::Ran {
            registrations: registrations.len(),
            enqueued,
        })
    }
}

/// Periodically enqueues sync jobs for due registrations.
pub struct SyncScheduler {
    core: Arc<SchedulerCore>,
    task: Mutex<Option<BackgroundTask>>,
}

impl SyncScheduler {
    /// Creates a stopped scheduler.
    pub fn new(
        config: SchedulerConfig,
        lock: DistributedLock,
        storage: Arc<dyn SyncStorage>,
        sync_queue: Arc<DurableQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                config,
                lock,
                storage,
                sync_queue,
                clock,
            }),
            task: Mutex::new(None),
        }
    }

    /// Scheduler settings.
    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// Runs one tick on the calling thread.
    ///
    /// The lock is always released before returning.
    pub fn tick(&self) -> ServerResult<TickReport> {
        self.core.tick()
    }

    /// Starts ticking. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let core = Arc::clone(&self.core);
        *slot = Some(BackgroundTask::spawn("sync_scheduler", move |shutdown| {
            tick_loop(core, shutdown)
        }));
        info!(
            lock = %self.core.config.lock_name,
            interval_ms = self.core.config.interval.as_millis() as u64,
            "scheduler started"
        );
    }

    /// Stops ticking and waits for a running tick to finish.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
            info!("scheduler stopped");
        }
    }

    /// Returns true while the scheduler ticks.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

async fn tick_loop(core: Arc<SchedulerCore>, mut shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(core.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if shutdown_requested(&shutdown) {
            break;
        }

        let tick = Arc::clone(&core);
        match tokio::task::spawn_blocking(move || tick.tick()).await {
            Ok(Ok(TickReport::Ran { enqueued, .. })) if enqueued > 0 => {
                debug!(enqueued, "sync jobs scheduled");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "scheduler tick failed"),
            Err(e) => warn!(error = %e, "scheduler tick panicked"),
        }
    }
}
