//! End-to-end tests of the sync pipelines.

use datasync_backend::{InMemoryBackend, SqliteBackend};
use datasync_jobs::{CycleOutcome, DistributedLock, ManualClock, SystemClock};
use datasync_protocol::{PendingAction, PendingChange, PendingStatus, SyncRecordsRequest, SyncRequest};
use datasync_server::{
    DatasetHandlers, DatasetOptions, DuePolicy, HashProvider, MemoryDatasetHandlers,
    MemoryStorage, ServerConfig, Sha256HashProvider, SyncServer, SyncStorage, TickReport,
    DEFAULT_LOCK_NAME,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    server: SyncServer,
    clock: Arc<ManualClock>,
    storage: Arc<MemoryStorage>,
    handlers: Arc<MemoryDatasetHandlers>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(MemoryStorage::new());
        let handlers = Arc::new(MemoryDatasetHandlers::new());
        let server = SyncServer::builder()
            .backend(Arc::new(InMemoryBackend::new()))
            .storage(storage.clone())
            .default_handlers(handlers.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        for queue in server.queues() {
            queue.create().unwrap();
        }
        Self {
            server,
            clock,
            storage,
            handlers,
        }
    }

    /// Runs every worker until all queues are drained.
    fn drain(&self) {
        loop {
            let mut busy = false;
            for worker in self.server.workers() {
                busy |= worker.run_once().unwrap() != CycleOutcome::Idle;
            }
            if !busy {
                break;
            }
        }
    }
}

fn update(hash: &str, pre_hash: &str, post: Value) -> PendingChange {
    PendingChange {
        hash: hash.into(),
        uid: "u1".into(),
        action: PendingAction::Update,
        pre_hash: Some(pre_hash.into()),
        post_hash: None,
        post: Some(post),
    }
}

#[test]
fn applied_then_stale_resubmission_collides() {
    let h = Harness::new();
    h.handlers
        .create("todos", "u1", json!({"title": "a"}), &Value::Null)
        .unwrap();
    let h0 = Sha256HashProvider.compute_hash(&json!({"title": "a"}));

    let change = update("c1", &h0, json!({"title": "b"}));
    h.server
        .sync("todos", SyncRequest::new("device-1").with_pending(change.clone()))
        .unwrap();
    h.drain();

    let response = h.server.sync("todos", SyncRequest::new("device-1")).unwrap();
    assert_eq!(response.updates.len(), 1);
    let applied = &response.updates[0];
    assert_eq!(applied.status, PendingStatus::Applied);
    let h1 = applied.record_hash.clone().unwrap();
    assert_ne!(h1, h0);

    // Same change again, now based on a stale hash.
    h.server
        .sync("todos", SyncRequest::new("device-1").with_pending(change))
        .unwrap();
    h.drain();

    let collisions = h.server.list_collisions("todos", &Value::Null).unwrap();
    assert_eq!(collisions.len(), 1);
    assert_eq!(collisions[0].hash, h0);
    assert_eq!(collisions[0].pre_value, Some(json!({"title": "b"})));

    let stored = h.handlers.read("todos", "u1", &Value::Null).unwrap().unwrap();
    assert_eq!(stored.data, json!({"title": "b"}));
    assert_eq!(Sha256HashProvider.compute_hash(&stored.data), h1);

    // Both submissions report back until acknowledged.
    let response = h.server.sync("todos", SyncRequest::new("device-1")).unwrap();
    let mut statuses: Vec<PendingStatus> =
        response.updates.iter().map(|outcome| outcome.status).collect();
    statuses.sort_by_key(|status| *status == PendingStatus::Collision);
    assert_eq!(statuses, vec![PendingStatus::Applied, PendingStatus::Collision]);
    assert_eq!(h.storage.list_pending("todos", "device-1").unwrap().len(), 2);

    h.server
        .sync("todos", SyncRequest::new("device-1").with_acknowledgement("c1"))
        .unwrap();
    h.drain();
    assert!(h.storage.list_outcomes("todos", "device-1").unwrap().is_empty());
    assert!(h.storage.list_pending("todos", "device-1").unwrap().is_empty());

    assert!(h.server.remove_collision("todos", &h0, &Value::Null).unwrap());
    assert!(h.server.list_collisions("todos", &Value::Null).unwrap().is_empty());
}

#[test]
fn acknowledged_outcomes_are_not_redelivered() {
    let h = Harness::new();
    let create = PendingChange {
        hash: "c1".into(),
        uid: "u9".into(),
        action: PendingAction::Create,
        pre_hash: None,
        post_hash: None,
        post: Some(json!({"title": "new"})),
    };
    h.server
        .sync("todos", SyncRequest::new("device-1").with_pending(create))
        .unwrap();
    h.drain();

    let response = h
        .server
        .sync("todos", SyncRequest::new("device-1").with_acknowledgement("c1"))
        .unwrap();
    assert!(response.updates.is_empty());
    h.drain();

    let response = h.server.sync("todos", SyncRequest::new("device-1")).unwrap();
    assert!(response.updates.is_empty());
    assert!(h.storage.list_outcomes("todos", "device-1").unwrap().is_empty());

    // A second acknowledgement of the same change is harmless.
    h.server
        .sync("todos", SyncRequest::new("device-1").with_acknowledgement("c1"))
        .unwrap();
    h.drain();
}

#[test]
fn applied_change_reaches_next_diff() {
    let h = Harness::new();
    h.handlers
        .create("todos", "u1", json!({"title": "a"}), &Value::Null)
        .unwrap();
    h.server.sync("todos", SyncRequest::new("device-1")).unwrap();

    assert!(matches!(
        h.server.scheduler().tick().unwrap(),
        TickReport::Ran { enqueued: 1, .. }
    ));
    h.drain();

    let first = h
        .server
        .sync_records(
            "todos",
            SyncRecordsRequest {
                client_id: "device-1".into(),
                ..SyncRecordsRequest::default()
            },
        )
        .unwrap();
    assert_eq!(first.create.len(), 1);
    let known = first
        .create
        .iter()
        .map(|(uid, entry)| (uid.clone(), entry.hash.clone()))
        .collect();

    let h0 = Sha256HashProvider.compute_hash(&json!({"title": "a"}));
    h.server
        .sync(
            "todos",
            SyncRequest::new("device-1").with_pending(update("c1", &h0, json!({"title": "b"}))),
        )
        .unwrap();
    h.drain();

    h.clock.advance(Duration::from_secs(10));
    assert!(matches!(
        h.server.scheduler().tick().unwrap(),
        TickReport::Ran { enqueued: 1, .. }
    ));
    h.drain();

    let response = h.server.sync("todos", SyncRequest::new("device-1")).unwrap();
    let records = h
        .server
        .sync_records(
            "todos",
            SyncRecordsRequest {
                client_id: "device-1".into(),
                known,
                ..SyncRecordsRequest::default()
            },
        )
        .unwrap();
    assert!(records.create.is_empty());
    assert_eq!(records.update["u1"].data, json!({"title": "b"}));
    assert_eq!(records.hash, response.hash);
    assert_ne!(records.hash, first.hash);
}

#[test]
fn records_with_changes_in_flight_are_held_back() {
    let h = Harness::new();
    h.handlers
        .create("todos", "u1", json!({"n": 1}), &Value::Null)
        .unwrap();
    h.handlers
        .create("todos", "u2", json!({"n": 2}), &Value::Null)
        .unwrap();
    h.server.sync("todos", SyncRequest::new("device-1")).unwrap();
    h.server.scheduler().tick().unwrap();
    h.drain();

    // The client edited u1 and holds outdated copies of both records.
    let request = SyncRecordsRequest {
        client_id: "device-1".into(),
        known: [("u1", "old"), ("u2", "old")]
            .into_iter()
            .map(|(uid, hash)| (uid.to_string(), hash.to_string()))
            .collect(),
        ..SyncRecordsRequest::default()
    };
    h.server
        .sync(
            "todos",
            SyncRequest::new("device-1").with_pending(update("c1", "old", json!({"n": 10}))),
        )
        .unwrap();

    let records = h.server.sync_records("todos", request.clone()).unwrap();
    assert_eq!(records.update.keys().collect::<Vec<_>>(), vec!["u2"]);

    // Once processed, the change no longer holds the record back.
    h.drain();
    let records = h.server.sync_records("todos", request).unwrap();
    assert_eq!(records.update.keys().collect::<Vec<_>>(), vec!["u1", "u2"]);
    assert_eq!(records.update["u1"].data, json!({"n": 1}));
}

#[test]
fn dataset_overrides_apply_to_pipelines() {
    let h = Harness::new();
    let custom = Arc::new(MemoryDatasetHandlers::new());
    custom
        .create("notes", "n1", json!({"body": "x"}), &Value::Null)
        .unwrap();

    h.server
        .datasets()
        .init("notes", DatasetOptions::new().with_handlers(custom.clone()));

    h.server.sync("notes", SyncRequest::new("device-1")).unwrap();
    h.server.scheduler().tick().unwrap();
    h.drain();

    let records = h
        .server
        .sync_records(
            "notes",
            SyncRecordsRequest {
                client_id: "device-1".into(),
                ..SyncRecordsRequest::default()
            },
        )
        .unwrap();
    assert!(records.create.contains_key("n1"));
    assert!(h.handlers.list("notes", &Value::Null, &Value::Null).unwrap().is_empty());
}

fn sqlite_server(path: &std::path::Path, storage: Arc<MemoryStorage>) -> SyncServer {
    let server = SyncServer::builder()
        .backend(Arc::new(SqliteBackend::open(path).unwrap()))
        .storage(storage)
        .build()
        .unwrap();
    for queue in server.queues() {
        queue.create().unwrap();
    }
    server
}

/// Two processes share one database file and one store; only one of them
/// schedules a due registration.
#[test]
fn two_schedulers_schedule_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("datasync.db");
    let storage = Arc::new(MemoryStorage::new());
    let a = sqlite_server(&path, storage.clone());
    let b = sqlite_server(&path, storage.clone());

    a.sync("todos", SyncRequest::new("device-1")).unwrap();

    let reports = std::thread::scope(|scope| {
        let first = scope.spawn(|| a.scheduler().tick().unwrap());
        let second = scope.spawn(|| b.scheduler().tick().unwrap());
        [first.join().unwrap(), second.join().unwrap()]
    });
    let enqueued: usize = reports
        .iter()
        .map(|report| match report {
            TickReport::Ran { enqueued, .. } => *enqueued,
            TickReport::Skipped => 0,
        })
        .sum();
    assert_eq!(enqueued, 1);

    let queue = a.queues()[2];
    assert_eq!(queue.stats().unwrap().pending, 1);
}

#[test]
fn held_scheduler_lock_blocks_every_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("datasync.db");
    let storage = Arc::new(MemoryStorage::new());
    let a = sqlite_server(&path, storage.clone());
    let b = sqlite_server(&path, storage);
    a.sync("todos", SyncRequest::new("device-1")).unwrap();

    let holder = DistributedLock::new(
        Arc::new(SqliteBackend::open(&path).unwrap()),
        Arc::new(SystemClock),
    );
    let handle = holder
        .acquire(DEFAULT_LOCK_NAME, Duration::from_secs(20))
        .unwrap()
        .unwrap();

    assert_eq!(a.scheduler().tick().unwrap(), TickReport::Skipped);
    assert_eq!(b.scheduler().tick().unwrap(), TickReport::Skipped);

    holder.release(&handle).unwrap();
    assert!(matches!(
        b.scheduler().tick().unwrap(),
        TickReport::Ran { enqueued: 1, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_server_syncs_end_to_end() {
    let storage = Arc::new(MemoryStorage::new());
    let handlers = Arc::new(MemoryDatasetHandlers::new());
    let config = ServerConfig::new()
        .with_worker_interval(Duration::from_millis(5))
        .with_scheduler_interval(Duration::from_millis(10))
        .with_due_policy(DuePolicy::EveryTick);
    let server = SyncServer::builder()
        .config(config)
        .backend(Arc::new(InMemoryBackend::new()))
        .storage(storage)
        .default_handlers(handlers.clone())
        .clock(Arc::new(SystemClock))
        .build()
        .unwrap();

    server.init_dataset("todos", DatasetOptions::new()).unwrap();
    let create = PendingChange {
        hash: "c1".into(),
        uid: "u1".into(),
        action: PendingAction::Create,
        pre_hash: None,
        post_hash: None,
        post: Some(json!({"title": "hello"})),
    };
    server
        .sync("todos", SyncRequest::new("device-1").with_pending(create))
        .unwrap();

    let request = SyncRecordsRequest {
        client_id: "device-1".into(),
        ..SyncRecordsRequest::default()
    };
    let mut synced = false;
    for _ in 0..500 {
        let records = server.sync_records("todos", request.clone()).unwrap();
        if records.create.contains_key("u1") {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(synced, "record never reached the client diff");

    let response = server.sync("todos", SyncRequest::new("device-1")).unwrap();
    assert!(response.hash.is_some());
    assert!(handlers.read("todos", "u1", &Value::Null).unwrap().is_some());

    server.stop_all().await.unwrap();
    assert!(!server.is_started());
}
