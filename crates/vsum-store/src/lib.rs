//! Job record store.
//!
//! This crate provides:
//! - The `JobStore` contract shared by the orchestrator and status streams
//! - Record validation applied before every write
//! - A Redis-backed store with a correlation-token index
//! - An in-memory store for tests and single-process runs

pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryJobStore;
pub use redis_store::{RedisJobStore, StoreConfig};
pub use store::{check_write, JobStore};
