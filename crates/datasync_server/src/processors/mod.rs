//! Queue processors.
//!
//! Every processor is idempotent: a queue item whose lease expired before it
//! was acked is delivered again, possibly to another process.

mod ack;
mod pending;
mod sync;

pub use ack::AckProcessor;
pub use pending::PendingProcessor;
pub use sync::SyncProcessor;
