//! Job orchestration for the video summary pipeline.
//!
//! This crate provides:
//! - The orchestrator state machine driving a job through its stages
//! - The stage executor contract and registry
//! - Bounded retry of failed jobs
//! - Working-directory cleanup after terminal states
//! - The keyframe stage with transcript and media analysis modes

pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod keyframes;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod stage;

pub use cleanup::{CleanupOutcome, CleanupTask};
pub use config::{AnalysisMode, PipelineConfig};
pub use dispatcher::{Dispatcher, RecordingDispatcher};
pub use error::{PipelineError, PipelineResult};
pub use keyframes::{AnalysisRequest, FrameExtractor, KeyframeAnalysis, KeyframeAnalyzer, KeyframeStage};
pub use logging::JobLogger;
pub use orchestrator::{AdvanceOutcome, Orchestrator, Submission};
pub use retry::RetryController;
pub use stage::{JobContext, StageError, StageExecutor, StageRegistry};
