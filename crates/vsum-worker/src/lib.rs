//! Pipeline worker.
//!
//! This crate provides:
//! - The executor loop consuming pipeline triggers from the queue
//! - Idle-delivery claiming and dead-lettering
//! - Command-backed stage executors
//! - Graceful shutdown

pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod stages;

pub use command::{CommandFrameExtractor, CommandKeyframeAnalyzer, CommandSpec, CommandStageExecutor};
pub use config::{StageCommands, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::{Disposition, JobExecutor};
pub use stages::build_registry;
