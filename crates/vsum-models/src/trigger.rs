//! Trigger payloads exchanged with the scheduler.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{CorrelationToken, JobId};

/// Submission of a new video for processing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubmitJob {
    /// Job ID; callers use the video's own ID so one video maps to one job
    pub job_id: JobId,
    /// Submitting principal
    pub owner_id: String,
    /// Video reference consumed by the transcript stage
    pub video_url: String,
    /// Observer token; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<CorrelationToken>,
}

impl SubmitJob {
    pub fn new(job_id: JobId, owner_id: impl Into<String>, video_url: impl Into<String>) -> Self {
        Self {
            job_id,
            owner_id: owner_id.into(),
            video_url: video_url.into(),
            correlation_token: None,
        }
    }

    pub fn with_token(mut self, token: CorrelationToken) -> Self {
        self.correlation_token = Some(token);
        self
    }
}

/// Removal of a job's working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CleanupRequest {
    pub job_id: JobId,
    pub work_dir: PathBuf,
    /// Attempt number that reached a terminal state
    #[serde(default)]
    pub attempt: u32,
}

impl CleanupRequest {
    pub fn new(job_id: JobId, work_dir: impl Into<PathBuf>, attempt: u32) -> Self {
        Self {
            job_id,
            work_dir: work_dir.into(),
            attempt,
        }
    }
}

/// Explicit retry of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetryRequest {
    pub job_id: JobId,
    /// Reset the retry budget before retrying
    #[serde(default)]
    pub force: bool,
}

impl RetryRequest {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id, force: false }
    }

    pub fn forced(job_id: JobId) -> Self {
        Self { job_id, force: true }
    }
}
