//! # Datasync Protocol
//!
//! Data model, queue job payloads and client messages for datasync.
//!
//! This crate provides:
//! - `DatasetClientRegistration` for managed sync subscriptions
//! - `PendingRecord` / `PendingOutcome` for client-submitted changes
//! - `Collision` for detected optimistic-concurrency conflicts
//! - `SyncSnapshot` / `SyncDiff` for the records clients pull
//! - Job payloads carried by the sync, pending and ack queues
//! - Client request/response messages
//!
//! This is a pure data crate with no I/O operations. Everything serializes
//! to JSON with `serde`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collision;
mod duration;
mod error;
mod jobs;
mod messages;
mod pending;
mod record;
mod registration;

pub use collision::Collision;
pub use duration::duration_ms;
pub use error::{ProtocolError, ProtocolResult};
pub use jobs::{AckJob, JobPayload, PendingJob, SyncJob};
pub use messages::{SyncRecordsRequest, SyncRecordsResponse, SyncRequest, SyncResponse};
pub use pending::{PendingAction, PendingChange, PendingOutcome, PendingRecord, PendingStatus};
pub use record::{DatasetRecord, RecordEntry, SyncDiff, SyncSnapshot};
pub use registration::{DatasetClientRegistration, RegistrationFilter, RegistrationPatch};
