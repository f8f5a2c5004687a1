//! Stage executor contract.
//!
//! The orchestrator depends only on `StageExecutor`; concrete transcript,
//! analysis, upload and summary implementations are plugged in through a
//! `StageRegistry`. Executors must be idempotent with respect to the
//! artifacts they produce, since a stage may run more than once under
//! at-least-once delivery.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use vsum_models::{Artifact, JobId, ProcessingJob, Stage, StageOutcome};

/// Everything an executor gets to see about the job it runs for.
#[derive(Debug, Clone, Serialize)]
pub struct JobContext {
    pub job_id: JobId,
    pub stage: Stage,
    /// Attempt number of the running attempt
    pub attempt: u32,
    pub video_url: String,
    /// Per-job scratch directory, removed by cleanup
    pub work_dir: PathBuf,
    /// Artifacts recorded by earlier stages of this attempt
    pub artifacts: Vec<(Stage, Artifact)>,
}

impl JobContext {
    pub fn new(job: &ProcessingJob, stage: Stage, work_dir: PathBuf) -> Self {
        Self {
            job_id: job.id.clone(),
            stage,
            attempt: job.attempt,
            video_url: job.video_url.clone(),
            work_dir,
            artifacts: job
                .artifacts
                .iter()
                .filter(|(s, _)| **s < stage)
                .flat_map(|(s, list)| list.iter().map(move |a| (*s, a.clone())))
                .collect(),
        }
    }

    /// First artifact of `kind` produced by an earlier stage.
    pub fn artifact(&self, kind: &str) -> Option<&Artifact> {
        self.artifacts.iter().map(|(_, a)| a).find(|a| a.kind == kind)
    }
}

/// Failure raised inside an executor before it is folded into a `StageOutcome`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("Stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid stage output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn invalid_output(msg: impl Into<String>) -> Self {
        Self::InvalidOutput(msg.into())
    }
}

impl From<StageError> for StageOutcome {
    fn from(err: StageError) -> Self {
        StageOutcome::failure(err.to_string())
    }
}

/// One pipeline stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run the stage. Failures are reported through the outcome, never raised.
    async fn execute(&self, ctx: &JobContext) -> StageOutcome;
}

/// Executors keyed by the stage they own.
#[derive(Clone, Default)]
pub struct StageRegistry {
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for an executable stage.
    pub fn register(mut self, stage: Stage, executor: Arc<dyn StageExecutor>) -> Self {
        debug_assert!(stage.is_executable(), "{} has no executor", stage);
        self.executors.insert(stage, executor);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageExecutor>> {
        self.executors.get(&stage)
    }

    /// Stages without a registered executor.
    pub fn missing(&self) -> Vec<Stage> {
        Stage::EXECUTABLE
            .iter()
            .copied()
            .filter(|s| !self.executors.contains_key(s))
            .collect()
    }

    /// Run the executor for `ctx.stage`; a missing executor is a stage failure.
    pub async fn execute(&self, ctx: &JobContext) -> StageOutcome {
        match self.get(ctx.stage) {
            Some(executor) => executor.execute(ctx).await,
            None => StageOutcome::failure(format!("No executor registered for stage {}", ctx.stage)),
        }
    }
}
