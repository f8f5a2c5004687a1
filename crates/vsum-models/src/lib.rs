//! Shared data models for the video summary pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Processing jobs and their stage state machine
//! - Stage outcomes reported by stage executors
//! - Observer-facing status snapshots and stream events
//! - Keyframe candidates and interval validation
//! - Trigger payloads exchanged with the scheduler

pub mod job;
pub mod keyframe;
pub mod stage;
pub mod status;
pub mod trigger;

// Re-export common types
pub use job::{Artifact, CorrelationToken, JobId, JobRecordError, ProcessingJob};
pub use keyframe::{validate_keyframe_intervals, KeyframeCandidate, KeyframeCategory};
pub use stage::{Stage, StageFailure, StageOutcome, StageOutput};
pub use status::{DedupKey, StatusEvent, StatusSnapshot};
pub use trigger::{CleanupRequest, RetryRequest, SubmitJob};
