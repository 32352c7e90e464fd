//! # Datasync Jobs
//!
//! The job pipeline shared by every datasync server process.
//!
//! This crate provides:
//! - [`DurableQueue`]: lease-based queue over a shared backend, with a
//!   background prune job
//! - [`PollingWorker`]: a loop that leases items from one queue and hands
//!   them to a [`Processor`]
//! - [`DistributedLock`]: mutual exclusion with bounded hold time and crash
//!   recovery through expiry
//! - [`Clock`] implementations and the [`Metrics`] collaborator
//!
//! ## Delivery Model
//!
//! Delivery is at-least-once. A leased item stays invisible for a visibility
//! timeout; if it is not acked before the lease expires it is delivered
//! again. Processors must therefore be idempotent.
//!
//! ## Key Invariants
//!
//! - No two workers hold a valid lease on the same item
//! - At most one unexpired holder exists per lock name
//! - After `stop()` returns, no loop iteration is in flight
//! - No item is dropped silently: it ends `done`, `failed`, or leasable
//!
//! ## Example
//!
//! ```rust
//! use datasync_backend::InMemoryBackend;
//! use datasync_jobs::{DurableQueue, QueueConfig, SystemClock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let queue = DurableQueue::new(
//!     "datasync_sync_queue",
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(SystemClock),
//!     QueueConfig::default(),
//! );
//! queue.create().unwrap();
//!
//! let id = queue.add(serde_json::json!({"datasetId": "todos"})).unwrap();
//! let item = queue.get(Duration::from_secs(30)).unwrap().unwrap();
//! assert_eq!(item.id, id);
//! queue.ack(&id).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod clock;
mod config;
mod error;
mod lock;
mod metrics;
mod queue;
mod task;
mod worker;

pub use clock::{add_duration, sub_duration, Clock, ManualClock, SystemClock};
pub use config::{QueueConfig, WorkerConfig};
pub use error::{JobError, JobResult};
pub use lock::{DistributedLock, LockHandle};
pub use metrics::{timed, timed_async, MemoryMetrics, Metrics, NoopMetrics, Sample};
pub use queue::DurableQueue;
pub use task::{sleep_or_shutdown, shutdown_requested, BackgroundTask, Shutdown};
pub use worker::{CycleOutcome, PollingWorker, Processor};
