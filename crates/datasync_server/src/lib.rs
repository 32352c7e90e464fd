//! # Datasync Server
//!
//! Server-side orchestration for offline-first dataset sync.
//!
//! This crate provides:
//! - [`SyncServer`]: the orchestrator owning queues, workers and the
//!   scheduler of one process, plus the client sync API
//! - [`SyncScheduler`]: lock-guarded periodic scheduling of sync jobs
//! - [`PendingProcessor`], [`SyncProcessor`], [`AckProcessor`]: the queue
//!   processors
//! - [`SyncStorage`] and [`DatasetHandlers`]: the storage seams, with
//!   in-memory implementations
//!
//! # Pipelines
//!
//! Three independent queues connect the components:
//!
//! ```text
//! client sync ──► pending queue ──► PendingProcessor ──► ack queue ──► AckProcessor
//!      │                                                     ▲
//!      └──────────── acknowledgements ───────────────────────┘
//!
//! SyncScheduler ──► sync queue ──► SyncProcessor ──► snapshot + diff
//! ```
//!
//! No ordering holds across queues. Correctness rests on the per-record hash
//! check done by the pending processor.
//!
//! # Example
//!
//! ```rust
//! use datasync_backend::InMemoryBackend;
//! use datasync_protocol::SyncRequest;
//! use datasync_server::{MemoryStorage, SyncServer};
//! use std::sync::Arc;
//!
//! let server = SyncServer::builder()
//!     .backend(Arc::new(InMemoryBackend::new()))
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .build()
//!     .unwrap();
//!
//! let response = server.sync("todos", SyncRequest::new("device-1")).unwrap();
//! assert!(response.hash.is_none());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handlers;
mod hash;
mod processors;
mod scheduler;
mod server;
mod storage;

pub use config::{ServerConfig, DEFAULT_LOCK_NAME};
pub use error::{ServerError, ServerResult};
pub use handlers::{Dataset, DatasetHandlers, DatasetOptions, Datasets, MemoryDatasetHandlers};
pub use hash::{HashProvider, Sha256HashProvider};
pub use processors::{AckProcessor, PendingProcessor, SyncProcessor};
pub use scheduler::{DuePolicy, SchedulerConfig, SyncScheduler, TickReport};
pub use server::{
    ServerState, SyncServer, SyncServerBuilder, ACK_QUEUE, ACK_WORKER, API_OPERATION,
    PENDING_QUEUE, PENDING_WORKER, SYNC_QUEUE, SYNC_WORKER,
};
pub use storage::{MemoryStorage, SyncStorage};
