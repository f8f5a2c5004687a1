//! Processing job record.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::stage::Stage;

/// Maximum accepted length of a correlation token.
const MAX_TOKEN_LENGTH: usize = 128;

/// Unique identifier for a job. Stable for the video's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque external identifier used to locate a job without its internal id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Generate a new random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parse and validate an externally supplied token.
    ///
    /// Valid tokens are 1-128 characters of ASCII alphanumerics, `-` and `_`.
    pub fn parse(raw: &str) -> Result<Self, JobRecordError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(JobRecordError::InvalidToken("token is blank".into()));
        }
        if trimmed.len() > MAX_TOKEN_LENGTH {
            return Err(JobRecordError::InvalidToken(format!(
                "token exceeds {} characters",
                MAX_TOKEN_LENGTH
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(JobRecordError::InvalidToken(
                "token contains invalid characters".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Artifact produced by a stage (transcript file, keyframe image, uploaded asset...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    /// Artifact kind, e.g. `transcript`, `keyframe`, `asset`, `summary`
    pub kind: String,
    /// Location of the artifact (path or URL)
    pub uri: String,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Artifact {
    pub fn new(kind: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            uri: uri.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Invariant violations detected on a job record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobRecordError {
    #[error("Invalid correlation token: {0}")]
    InvalidToken(String),

    #[error("Progress out of range: {0}")]
    ProgressOutOfRange(u8),

    #[error("Completed job must have progress 100 and no error")]
    IncompleteCompletion,

    #[error("Failed job must carry an error")]
    MissingError,

    #[error("Error present on non-failed job in stage {0}")]
    UnexpectedError(Stage),

    #[error("Owner must not be empty")]
    MissingOwner,

    #[error("Retry count {count} exceeds maximum {max}")]
    RetryBudgetExceeded { count: u32, max: u32 },
}

/// Persisted state of one video's trip through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessingJob {
    /// Job ID (stable for the video's lifetime)
    pub id: JobId,
    /// Submitting principal; immutable after creation
    pub owner_id: String,
    /// Source video reference handed to the first stage
    pub video_url: String,
    /// External identifier used by status observers
    pub correlation_token: CorrelationToken,
    /// Current stage
    #[serde(default)]
    pub stage: Stage,
    /// Progress percentage (0-100)
    #[serde(default)]
    pub progress: u8,
    /// Current processing step description
    pub current_step: String,
    /// Error message, present only when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stage that was running when the job failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    /// Number of explicit retries counted against the budget
    #[serde(default)]
    pub retry_count: u32,
    /// Attempt number carried by dispatches; bumped on every reopen, never reset
    #[serde(default)]
    pub attempt: u32,
    /// Warnings collected during the current attempt
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Artifacts recorded per completed stage
    #[serde(default)]
    pub artifacts: BTreeMap<Stage, Vec<Artifact>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// Create a new pending job.
    pub fn new(
        id: JobId,
        owner_id: impl Into<String>,
        video_url: impl Into<String>,
        correlation_token: CorrelationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: owner_id.into(),
            video_url: video_url.into(),
            correlation_token,
            stage: Stage::Pending,
            progress: 0,
            current_step: Stage::Pending.label().to_string(),
            error: None,
            failed_stage: None,
            retry_count: 0,
            attempt: 0,
            warnings: Vec::new(),
            artifacts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Raise progress, never lowering it within an attempt.
    pub fn raise_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    /// Enter an executable stage.
    pub fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.touch();
    }

    /// Mark job as completed.
    pub fn complete(&mut self) {
        self.stage = Stage::Completed;
        self.progress = 100;
        self.current_step = Stage::Completed.label().to_string();
        self.error = None;
        self.touch();
    }

    /// Mark job as failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.stage.is_terminal() {
            self.failed_stage = Some(self.stage);
        }
        self.stage = Stage::Failed;
        self.error = Some(error.into());
        self.current_step = Stage::Failed.label().to_string();
        self.touch();
    }

    /// Reopen a failed job for another attempt.
    ///
    /// `retry_count` may go down on a forced retry; `attempt` never does.
    pub fn reopen(&mut self, retry_count: u32) {
        self.stage = Stage::Pending;
        self.progress = 0;
        self.current_step = "Queued for retry".to_string();
        self.error = None;
        self.failed_stage = None;
        self.retry_count = retry_count;
        // Records written before `attempt` existed dispatched under `retry_count`
        self.attempt = self.attempt.saturating_add(1).max(retry_count);
        self.warnings.clear();
        self.artifacts.clear();
        self.touch();
    }

    /// Replace the artifacts recorded for a stage.
    pub fn record_artifacts(&mut self, stage: Stage, artifacts: Vec<Artifact>) {
        if artifacts.is_empty() {
            self.artifacts.remove(&stage);
        } else {
            self.artifacts.insert(stage, artifacts);
        }
    }

    /// All artifacts of a given kind, across stages.
    pub fn artifacts_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Artifact> + 'a {
        self.artifacts
            .values()
            .flatten()
            .filter(move |a| a.kind == kind)
    }

    /// Check the record's invariants.
    pub fn validate(&self) -> Result<(), JobRecordError> {
        if self.owner_id.trim().is_empty() {
            return Err(JobRecordError::MissingOwner);
        }
        if self.progress > 100 {
            return Err(JobRecordError::ProgressOutOfRange(self.progress));
        }
        match self.stage {
            Stage::Completed if self.progress != 100 || self.error.is_some() => {
                Err(JobRecordError::IncompleteCompletion)
            }
            Stage::Failed if self.error.is_none() => Err(JobRecordError::MissingError),
            stage if stage != Stage::Failed && self.error.is_some() => {
                Err(JobRecordError::UnexpectedError(stage))
            }
            _ => Ok(()),
        }
    }

    /// Check the retry budget in addition to the record invariants.
    pub fn validate_with_budget(&self, max_retries: u32) -> Result<(), JobRecordError> {
        self.validate()?;
        if self.retry_count > max_retries {
            return Err(JobRecordError::RetryBudgetExceeded {
                count: self.retry_count,
                max: max_retries,
            });
        }
        Ok(())
    }
}
