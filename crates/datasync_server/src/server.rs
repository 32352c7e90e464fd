//! The orchestrator handle.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handlers::{Dataset, DatasetHandlers, DatasetOptions, Datasets, MemoryDatasetHandlers};
use crate::hash::{HashProvider, Sha256HashProvider};
use crate::processors::{AckProcessor, PendingProcessor, SyncProcessor};
use crate::scheduler::SyncScheduler;
use crate::storage::SyncStorage;
use datasync_backend::{LockBackend, QueueBackend};
use datasync_jobs::{
    timed, Clock, DistributedLock, DurableQueue, Metrics, NoopMetrics, PollingWorker, Processor,
    SystemClock,
};
use datasync_protocol::{
    AckJob, Collision, DatasetClientRegistration, PendingJob, PendingRecord, PendingStatus,
    RegistrationFilter,
    RegistrationPatch, SyncDiff, SyncRecordsRequest, SyncRecordsResponse, SyncRequest,
    SyncResponse,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Queue carrying [`AckJob`]s.
pub const ACK_QUEUE: &str = "datasync_ack_queue";
/// Queue carrying [`PendingJob`]s.
pub const PENDING_QUEUE: &str = "datasync_pending_queue";
/// Queue carrying sync jobs.
pub const SYNC_QUEUE: &str = "datasync_sync_queue";

/// Worker draining [`SYNC_QUEUE`].
pub const SYNC_WORKER: &str = "sync_worker";
/// Worker draining [`ACK_QUEUE`].
pub const ACK_WORKER: &str = "ack_worker";
/// Worker draining [`PENDING_QUEUE`].
pub const PENDING_WORKER: &str = "pending_worker";

/// Operation name the client API is recorded under.
pub const API_OPERATION: &str = "sync_api_process_time";

/// Lifecycle state of a [`SyncServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Collaborators are connected; no loop runs.
    Connected,
    /// Queues, workers and the scheduler run.
    Started,
}

/// Builder for [`SyncServer`].
///
/// The queue backend, lock backend and storage are required. Everything
/// else has a default.
pub struct SyncServerBuilder {
    config: ServerConfig,
    queue_backend: Option<Arc<dyn QueueBackend>>,
    lock_backend: Option<Arc<dyn LockBackend>>,
    storage: Option<Arc<dyn SyncStorage>>,
    handlers: Option<Arc<dyn DatasetHandlers>>,
    hasher: Option<Arc<dyn HashProvider>>,
    metrics: Option<Arc<dyn Metrics>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SyncServerBuilder {
    fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            queue_backend: None,
            lock_backend: None,
            storage: None,
            handlers: None,
            hasher: None,
            metrics: None,
            clock: None,
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses one backend for both queues and locks.
    pub fn backend<B>(mut self, backend: Arc<B>) -> Self
    where
        B: QueueBackend + LockBackend + 'static,
    {
        self.queue_backend = Some(backend.clone());
        self.lock_backend = Some(backend);
        self
    }

    /// Sets the queue backend.
    pub fn queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.queue_backend = Some(backend);
        self
    }

    /// Sets the lock backend.
    pub fn lock_backend(mut self, backend: Arc<dyn LockBackend>) -> Self {
        self.lock_backend = Some(backend);
        self
    }

    /// Sets the storage.
    pub fn storage(mut self, storage: Arc<dyn SyncStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the handlers of datasets without an override.
    pub fn default_handlers(mut self, handlers: Arc<dyn DatasetHandlers>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Sets the hash provider.
    pub fn hasher(mut self, hasher: Arc<dyn HashProvider>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Sets the metrics collaborator.
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the configuration and wires the server. Nothing is started.
    pub fn build(self) -> ServerResult<SyncServer> {
        self.config.validate()?;
        let queue_backend = self
            .queue_backend
            .ok_or_else(|| ServerError::Configuration("queue backend not set".into()))?;
        let lock_backend = self
            .lock_backend
            .ok_or_else(|| ServerError::Configuration("lock backend not set".into()))?;
        let storage = self
            .storage
            .ok_or_else(|| ServerError::Configuration("storage not set".into()))?;
        let handlers = self
            .handlers
            .unwrap_or_else(|| Arc::new(MemoryDatasetHandlers::new()));
        let hasher = self
            .hasher
            .unwrap_or_else(|| Arc::new(Sha256HashProvider));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = self.config;

        let queue = |name: &str| {
            Arc::new(DurableQueue::new(
                name,
                Arc::clone(&queue_backend),
                Arc::clone(&clock),
                config.queue_config(),
            ))
        };
        let ack_queue = queue(ACK_QUEUE);
        let pending_queue = queue(PENDING_QUEUE);
        let sync_queue = queue(SYNC_QUEUE);

        let datasets = Arc::new(Datasets::new(handlers, config.default_sync_frequency));

        let sync_processor: Arc<dyn Processor> = Arc::new(SyncProcessor::new(
            Arc::clone(&clock),
            Arc::clone(&storage),
            Arc::clone(&datasets),
            Arc::clone(&hasher),
        ));
        let ack_processor: Arc<dyn Processor> = Arc::new(AckProcessor::new(Arc::clone(&storage)));
        let pending_processor: Arc<dyn Processor> = Arc::new(PendingProcessor::new(
            Arc::clone(&clock),
            Arc::clone(&storage),
            Arc::clone(&datasets),
            hasher,
            Arc::clone(&ack_queue),
        ));

        let worker = |name: &str, queue: &Arc<DurableQueue>, processor: Arc<dyn Processor>| {
            PollingWorker::new(name, Arc::clone(queue), processor, config.worker_config())
        };
        let sync_worker = worker(SYNC_WORKER, &sync_queue, sync_processor);
        let ack_worker = worker(ACK_WORKER, &ack_queue, ack_processor);
        let pending_worker = worker(PENDING_WORKER, &pending_queue, pending_processor);

        let scheduler = SyncScheduler::new(
            config.scheduler_config(),
            DistributedLock::new(lock_backend, Arc::clone(&clock)),
            Arc::clone(&storage),
            Arc::clone(&sync_queue),
            Arc::clone(&clock),
        );

        Ok(SyncServer {
            config,
            storage,
            datasets,
            metrics,
            clock,
            ack_queue,
            pending_queue,
            sync_queue,
            sync_worker,
            ack_worker,
            pending_worker,
            scheduler,
            state: Mutex::new(ServerState::Connected),
        })
    }
}

/// Owns every queue, worker and the scheduler of one server process, and
/// serves the client sync API.
///
/// Several processes may run a `SyncServer` against the same backends and
/// storage; the scheduler lock keeps scheduling single-instance.
pub struct SyncServer {
    config: ServerConfig,
    storage: Arc<dyn SyncStorage>,
    datasets: Arc<Datasets>,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
    ack_queue: Arc<DurableQueue>,
    pending_queue: Arc<DurableQueue>,
    sync_queue: Arc<DurableQueue>,
    sync_worker: PollingWorker,
    ack_worker: PollingWorker,
    pending_worker: PollingWorker,
    scheduler: SyncScheduler,
    state: Mutex<ServerState>,
}

impl SyncServer {
    /// Starts building a server.
    pub fn builder() -> SyncServerBuilder {
        SyncServerBuilder::new()
    }

    /// Creates the queues and starts prune jobs, workers and the scheduler.
    /// No-op if already started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> ServerResult<()> {
        let mut state = self.state.lock();
        if *state == ServerState::Started {
            return Ok(());
        }
        for queue in self.queues() {
            queue.create()?;
        }
        for queue in self.queues() {
            queue.start_prune_job(true);
        }
        self.start_workers();
        self.scheduler.start();
        *state = ServerState::Started;
        info!("sync server started");
        Ok(())
    }

    /// Starts the three workers.
    pub fn start_workers(&self) {
        for worker in self.workers() {
            worker.work();
        }
    }

    /// Stops prune jobs, workers and the scheduler, and marks every
    /// registration stopped. No-op before [`SyncServer::start`].
    ///
    /// Every loop is stopped even if updating the registrations fails; that
    /// failure is returned afterwards.
    pub async fn stop_all(&self) -> ServerResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        for queue in self.queues() {
            queue.stop_prune_job().await;
        }
        let stopped = self
            .storage
            .update_registrations(&RegistrationFilter::all(), &RegistrationPatch::stopped(true));
        for worker in self.workers() {
            worker.stop().await;
        }
        self.scheduler.stop().await;
        *self.state.lock() = ServerState::Connected;
        info!("sync server stopped");
        stopped.map(|_| ())
    }

    /// Registers a dataset, starts the server if needed and re-activates the
    /// dataset's registrations.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn init_dataset(&self, dataset_id: &str, options: DatasetOptions) -> ServerResult<Dataset> {
        require("dataset id", dataset_id)?;
        let dataset = self.datasets.init(dataset_id, options);
        self.start()?;
        let resumed = self.storage.update_registrations(
            &RegistrationFilter::dataset(dataset_id),
            &RegistrationPatch::stopped(false).with_sync_frequency(dataset.sync_frequency),
        )?;
        info!(dataset = %dataset_id, resumed, "dataset initialised");
        Ok(dataset)
    }

    /// Marks every registration of a dataset stopped. No-op when the server
    /// is not started. Returns the number of registrations stopped.
    pub fn stop_dataset(&self, dataset_id: &str) -> ServerResult<usize> {
        if !self.is_started() {
            return Ok(0);
        }
        let stopped = self.storage.update_registrations(
            &RegistrationFilter::dataset(dataset_id),
            &RegistrationPatch::stopped(true),
        )?;
        info!(dataset = %dataset_id, stopped, "dataset stopped");
        Ok(stopped)
    }

    /// Client sync call: records the registration, enqueues submitted
    /// changes and acknowledgements, and returns the last dataset hash with
    /// the outcomes the client has not acknowledged.
    pub fn sync(&self, dataset_id: &str, request: SyncRequest) -> ServerResult<SyncResponse> {
        timed(self.metrics.as_ref(), API_OPERATION, || {
            self.handle_sync(dataset_id, request)
        })
    }

    fn handle_sync(&self, dataset_id: &str, request: SyncRequest) -> ServerResult<SyncResponse> {
        require("dataset id", dataset_id)?;
        require("client id", &request.client_id)?;
        for change in &request.pending {
            change.validate()?;
        }

        let dataset = self.datasets.resolve(dataset_id);
        let registration = DatasetClientRegistration::new(
            dataset_id,
            &request.client_id,
            dataset.sync_frequency,
            self.clock.now(),
        )
        .with_query_params(request.query_params.clone())
        .with_meta_data(request.meta_data.clone());
        let registration = self.storage.upsert_registration(registration)?;

        for change in &request.pending {
            let job_id = self.pending_queue.add_job(&PendingJob {
                dataset_id: dataset_id.to_string(),
                client_id: request.client_id.clone(),
                meta_data: request.meta_data.clone(),
                change: change.clone(),
            })?;
            // The worker may already have processed the item; its record wins.
            self.storage.insert_pending(PendingRecord::received(
                dataset_id,
                &request.client_id,
                change,
                Some(job_id),
                self.clock.now(),
            ))?;
        }
        if !request.acknowledgements.is_empty() {
            self.ack_queue.add_job(&AckJob::Acknowledge {
                dataset_id: dataset_id.to_string(),
                client_id: request.client_id.clone(),
                hashes: request.acknowledgements.clone(),
            })?;
        }

        let acknowledged: BTreeSet<&str> =
            request.acknowledgements.iter().map(String::as_str).collect();
        let updates = self
            .storage
            .list_outcomes(dataset_id, &request.client_id)?
            .into_iter()
            .filter(|outcome| !acknowledged.contains(outcome.hash.as_str()))
            .collect();

        debug!(
            dataset = %dataset_id,
            client = %request.client_id,
            pending = request.pending.len(),
            acknowledgements = request.acknowledgements.len(),
            "sync request accepted"
        );
        Ok(SyncResponse {
            hash: registration.global_hash,
            updates,
        })
    }

    /// Records the client must apply to reach the latest snapshot, leaving
    /// out records with changes still in flight for that client. A change is
    /// in flight from the sync call that queued it until it is processed.
    pub fn sync_records(
        &self,
        dataset_id: &str,
        request: SyncRecordsRequest,
    ) -> ServerResult<SyncRecordsResponse> {
        timed(self.metrics.as_ref(), API_OPERATION, || {
            require("dataset id", dataset_id)?;
            require("client id", &request.client_id)?;

            let Some(snapshot) = self.storage.get_snapshot(dataset_id, &request.client_id)? else {
                return Ok(SyncRecordsResponse::default());
            };
            let in_flight: BTreeSet<String> = self
                .storage
                .list_pending(dataset_id, &request.client_id)?
                .into_iter()
                .filter(|record| record.status == PendingStatus::Clean)
                .map(|record| record.uid)
                .collect();
            Ok(SyncDiff::compute(&request.known, &snapshot)
                .without(&in_flight)
                .into())
        })
    }

    /// Collisions recorded for a dataset.
    pub fn list_collisions(&self, dataset_id: &str, meta: &Value) -> ServerResult<Vec<Collision>> {
        timed(self.metrics.as_ref(), API_OPERATION, || {
            let dataset = self.datasets.resolve(dataset_id);
            dataset.handlers.list_collisions(dataset_id, meta)
        })
    }

    /// Removes the collisions recorded under `hash`.
    pub fn remove_collision(&self, dataset_id: &str, hash: &str, meta: &Value) -> ServerResult<bool> {
        timed(self.metrics.as_ref(), API_OPERATION, || {
            let dataset = self.datasets.resolve(dataset_id);
            dataset.handlers.remove_collision(dataset_id, hash, meta)
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Returns true between [`SyncServer::start`] and [`SyncServer::stop_all`].
    pub fn is_started(&self) -> bool {
        self.state() == ServerState::Started
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Dataset registry.
    pub fn datasets(&self) -> &Datasets {
        &self.datasets
    }

    /// The ack, pending and sync queues.
    pub fn queues(&self) -> [&Arc<DurableQueue>; 3] {
        [&self.ack_queue, &self.pending_queue, &self.sync_queue]
    }

    /// The sync, ack and pending workers.
    pub fn workers(&self) -> [&PollingWorker; 3] {
        [&self.sync_worker, &self.ack_worker, &self.pending_worker]
    }

    /// Worker draining the sync queue.
    pub fn sync_worker(&self) -> &PollingWorker {
        &self.sync_worker
    }

    /// Worker draining the ack queue.
    pub fn ack_worker(&self) -> &PollingWorker {
        &self.ack_worker
    }

    /// Worker draining the pending queue.
    pub fn pending_worker(&self) -> &PollingWorker {
        &self.pending_worker
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("datasets", &self.datasets)
            .finish_non_exhaustive()
    }
}

fn require(what: &str, value: &str) -> ServerResult<()> {
    if value.is_empty() {
        return Err(ServerError::InvalidRequest(format!("{what} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use datasync_backend::InMemoryBackend;
    use datasync_jobs::MemoryMetrics;
    use datasync_protocol::{PendingAction, PendingChange};
    use serde_json::json;
    use std::time::Duration;

    fn server() -> SyncServer {
        SyncServer::builder()
            .backend(Arc::new(InMemoryBackend::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .unwrap()
    }

    fn create(hash: &str, uid: &str) -> PendingChange {
        PendingChange {
            hash: hash.into(),
            uid: uid.into(),
            action: PendingAction::Create,
            pre_hash: None,
            post_hash: None,
            post: Some(json!({"title": uid})),
        }
    }

    #[test]
    fn build_requires_collaborators() {
        let err = SyncServer::builder()
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));

        let err = SyncServer::builder()
            .queue_backend(Arc::new(InMemoryBackend::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("lock backend"));

        let err = SyncServer::builder()
            .backend(Arc::new(InMemoryBackend::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("storage"));
    }

    #[test]
    fn build_rejects_zero_periods() {
        let config = ServerConfig::new().with_scheduler_interval(Duration::ZERO);
        let err = SyncServer::builder()
            .config(config)
            .backend(Arc::new(InMemoryBackend::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));

        let config = ServerConfig::from_json(r#"{"pruneInterval": 0}"#).unwrap();
        let err = SyncServer::builder()
            .config(config)
            .backend(Arc::new(InMemoryBackend::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("pruneInterval"));
    }

    #[test]
    fn components_use_fixed_names() {
        let server = server();
        let queues: Vec<&str> = server.queues().into_iter().map(|q| q.name()).collect();
        assert_eq!(queues, vec![ACK_QUEUE, PENDING_QUEUE, SYNC_QUEUE]);
        let workers: Vec<&str> = server.workers().into_iter().map(|w| w.name()).collect();
        assert_eq!(workers, vec![SYNC_WORKER, ACK_WORKER, PENDING_WORKER]);
        assert_eq!(server.state(), ServerState::Connected);
        assert_eq!(server.scheduler().config().lock_name, "locks:sync:SyncScheduler");
    }

    #[test]
    fn sync_enqueues_changes_and_acknowledgements() {
        let server = server();
        for queue in server.queues() {
            queue.create().unwrap();
        }

        let request = SyncRequest::new("device-1")
            .with_pending(create("c1", "u1"))
            .with_pending(create("c2", "u2"))
            .with_acknowledgement("c0");
        let response = server.sync("todos", request).unwrap();
        assert_eq!(response.hash, None);
        assert!(response.updates.is_empty());

        assert_eq!(server.pending_queue.stats().unwrap().pending, 2);
        assert_eq!(server.ack_queue.stats().unwrap().pending, 1);
        let received = server.storage.list_pending("todos", "device-1").unwrap();
        assert_eq!(received.len(), 2);
        assert!(received
            .iter()
            .all(|r| r.status == PendingStatus::Clean && r.job_id.is_some()));
        let registrations = server
            .storage
            .get_registrations(&RegistrationFilter::pair("todos", "device-1"))
            .unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].sync_frequency, Duration::from_secs(10));
    }

    #[test]
    fn sync_rejects_invalid_requests() {
        let server = server();
        let err = server.sync("todos", SyncRequest::new("")).unwrap_err();
        assert!(err.is_client_error());

        let mut bad = create("c1", "u1");
        bad.post = None;
        let err = server
            .sync("todos", SyncRequest::new("device-1").with_pending(bad))
            .unwrap_err();
        assert!(matches!(err, ServerError::Protocol(_)));

        let err = server.sync("", SyncRequest::new("device-1")).unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[test]
    fn api_calls_are_timed() {
        let metrics = Arc::new(MemoryMetrics::new());
        let server = SyncServer::builder()
            .backend(Arc::new(InMemoryBackend::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .metrics(metrics.clone())
            .build()
            .unwrap();

        server.sync("todos", SyncRequest::new("device-1")).unwrap();
        let _ = server.sync("todos", SyncRequest::new(""));
        server
            .sync_records("todos", SyncRecordsRequest::default())
            .unwrap_err();
        server.list_collisions("todos", &Value::Null).unwrap();

        assert_eq!(metrics.count(API_OPERATION), 4);
        let failures = metrics.samples().iter().filter(|s| !s.success).count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn sync_records_without_snapshot_is_empty() {
        let server = server();
        let mut request = SyncRecordsRequest::default();
        request.client_id = "device-1".into();
        request.known.insert("u1".into(), "h1".into());
        let response = server.sync_records("todos", request).unwrap();
        assert_eq!(response, SyncRecordsResponse::default());
    }

    #[test]
    fn stop_dataset_before_start_is_noop() {
        let server = server();
        server.sync("todos", SyncRequest::new("device-1")).unwrap();
        assert_eq!(server.stop_dataset("todos").unwrap(), 0);
    }

    #[tokio::test]
    async fn lifecycle() {
        let server = server();
        server.stop_all().await.unwrap();
        assert_eq!(server.state(), ServerState::Connected);

        server.start().unwrap();
        server.start().unwrap();
        assert!(server.is_started());
        assert!(server.workers().iter().all(|w| w.is_running()));
        assert!(server.queues().iter().all(|q| q.is_pruning()));
        assert!(server.scheduler().is_running());

        server.sync("todos", SyncRequest::new("device-1")).unwrap();
        server.stop_all().await.unwrap();
        assert_eq!(server.state(), ServerState::Connected);
        assert!(server.workers().iter().all(|w| !w.is_running()));
        assert!(server.queues().iter().all(|q| !q.is_pruning()));
        assert!(!server.scheduler().is_running());

        let active = server
            .storage
            .get_registrations(&RegistrationFilter::active())
            .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn init_dataset_starts_and_resumes() {
        let server = server();
        server.sync("todos", SyncRequest::new("device-1")).unwrap();
        server
            .storage
            .update_registrations(&RegistrationFilter::all(), &RegistrationPatch::stopped(true))
            .unwrap();

        let dataset = server
            .init_dataset(
                "todos",
                DatasetOptions::new().with_sync_frequency(Duration::from_secs(2)),
            )
            .unwrap();
        assert_eq!(dataset.sync_frequency, Duration::from_secs(2));
        assert!(server.is_started());

        let registrations = server
            .storage
            .get_registrations(&RegistrationFilter::dataset("todos"))
            .unwrap();
        assert!(!registrations[0].stopped);
        assert_eq!(registrations[0].sync_frequency, Duration::from_secs(2));

        assert_eq!(server.stop_dataset("todos").unwrap(), 1);
        server.stop_all().await.unwrap();
    }
}
