//! Redis Streams transport for pipeline triggers.
//!
//! This crate provides:
//! - Trigger messages (stage runs, cleanup, retry)
//! - Enqueueing with idempotency keys
//! - Consumer-group consumption with ack, idle claim and DLQ

pub mod error;
pub mod message;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use message::{PipelineMessage, StageDispatch};
pub use queue::{Delivery, JobQueue, QueueConfig};
