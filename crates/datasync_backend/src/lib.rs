//! # Datasync Backend
//!
//! Shared backing store for the datasync job pipeline.
//!
//! This crate provides the lowest-level persistence for the two kinds of rows
//! the pipeline owns directly:
//! - queue items (durable queue rows with lease state)
//! - lock rows (one row per distributed lock name)
//!
//! ## Design Principles
//!
//! - Backends guarantee per-operation atomicity (lease selection-and-transition,
//!   lock compare-and-set). Callers never add in-process locking on top.
//! - Backends take `now` explicitly, so expiry is decided by the caller's clock
//! - Must be `Send + Sync`; many loops share one backend
//! - Transient failures surface as errors and are never retried internally
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and single-process deployments
//! - [`SqliteBackend`] - A database file shared by every process of a fleet
//!
//! ## Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use datasync_backend::{InMemoryBackend, ItemState, QueueBackend, QueueItem};
//!
//! let backend = InMemoryBackend::new();
//! backend.ensure_queue("jobs").unwrap();
//!
//! let now = Utc::now();
//! backend
//!     .insert(QueueItem::new("a", "jobs", serde_json::json!({"n": 1}), now))
//!     .unwrap();
//!
//! let leased = backend
//!     .lease_next("jobs", now, now + Duration::seconds(30))
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(leased.state, ItemState::Inflight);
//! assert_eq!(leased.attempts, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backend;
mod error;
mod memory;
mod sqlite;
mod types;

pub use backend::{LockBackend, QueueBackend};
pub use error::{BackendError, BackendResult};
pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;
pub use types::{ItemState, LockRow, QueueItem, QueueStats};
