//! Pipeline stages and the outcomes stage executors report.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::Artifact;

/// Processing stage of a job.
///
/// The forward chain is fixed:
/// `Pending -> ExtractingTranscript -> ExtractingKeyframes -> UploadingAssets
/// -> GeneratingSummary -> Completed`. Any non-terminal stage may move to
/// `Failed`; `Failed -> Pending` is taken only by an explicit retry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Job is created and waiting for its first stage
    #[default]
    Pending,
    /// Fetching the timestamped transcript
    ExtractingTranscript,
    /// AI analysis plus keyframe extraction
    ExtractingKeyframes,
    /// Uploading keyframes and other assets
    UploadingAssets,
    /// Finalizing the summary document
    GeneratingSummary,
    /// All stages finished
    Completed,
    /// A stage reported failure
    Failed,
}

impl Stage {
    /// Stages that are executed by a stage executor, in order.
    pub const EXECUTABLE: [Stage; 4] = [
        Stage::ExtractingTranscript,
        Stage::ExtractingKeyframes,
        Stage::UploadingAssets,
        Stage::GeneratingSummary,
    ];

    /// First executable stage.
    pub fn first() -> Self {
        Stage::ExtractingTranscript
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::ExtractingTranscript => "extracting_transcript",
            Stage::ExtractingKeyframes => "extracting_keyframes",
            Stage::UploadingAssets => "uploading_assets",
            Stage::GeneratingSummary => "generating_summary",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Human-readable label used for `current_step` and completed steps.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Pending => "Queued",
            Stage::ExtractingTranscript => "Extracting transcript",
            Stage::ExtractingKeyframes => "Analyzing video and extracting keyframes",
            Stage::UploadingAssets => "Uploading assets",
            Stage::GeneratingSummary => "Generating summary",
            Stage::Completed => "Complete",
            Stage::Failed => "Failed",
        }
    }

    /// Terminal stages receive no further dispatch without a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// True while an attempt is running (neither pending nor terminal).
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, Stage::Pending) && !self.is_terminal()
    }

    /// True for stages owned by a stage executor.
    pub fn is_executable(&self) -> bool {
        Self::EXECUTABLE.contains(self)
    }

    /// Next stage in the forward chain, `None` for terminal stages.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Pending => Some(Stage::ExtractingTranscript),
            Stage::ExtractingTranscript => Some(Stage::ExtractingKeyframes),
            Stage::ExtractingKeyframes => Some(Stage::UploadingAssets),
            Stage::UploadingAssets => Some(Stage::GeneratingSummary),
            Stage::GeneratingSummary => Some(Stage::Completed),
            Stage::Completed | Stage::Failed => None,
        }
    }

    /// Position in the forward chain. `Failed` has no position.
    pub fn position(&self) -> Option<usize> {
        match self {
            Stage::Pending => Some(0),
            Stage::ExtractingTranscript => Some(1),
            Stage::ExtractingKeyframes => Some(2),
            Stage::UploadingAssets => Some(3),
            Stage::GeneratingSummary => Some(4),
            Stage::Completed => Some(5),
            Stage::Failed => None,
        }
    }

    /// Executable stages strictly before this one.
    pub fn preceding(&self) -> Vec<Stage> {
        match self.position() {
            Some(pos) => Self::EXECUTABLE
                .iter()
                .copied()
                .filter(|s| s.position().is_some_and(|p| p < pos))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(&self, to: Stage) -> bool {
        match (self, to) {
            (Stage::Failed, Stage::Pending) => true,
            (from, Stage::Failed) => !from.is_terminal(),
            (from, to) => from.next() == Some(to),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Stage::Pending),
            "extracting_transcript" => Ok(Stage::ExtractingTranscript),
            "extracting_keyframes" => Ok(Stage::ExtractingKeyframes),
            "uploading_assets" => Ok(Stage::UploadingAssets),
            "generating_summary" => Ok(Stage::GeneratingSummary),
            "completed" => Ok(Stage::Completed),
            "failed" => Ok(Stage::Failed),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

/// Payload of a successful stage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageOutput {
    /// Progress points earned by this stage
    pub progress_delta: u8,
    /// Step description shown while the next stage runs
    pub next_step: String,
    /// Artifacts produced by this stage
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Non-fatal problems worth surfacing to observers
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn new(progress_delta: u8, next_step: impl Into<String>) -> Self {
        Self {
            progress_delta,
            next_step: next_step.into(),
            artifacts: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Failure detail reported by a stage executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageFailure {
    pub message: String,
}

/// Result of one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Success(StageOutput),
    Failure(StageFailure),
}

impl StageOutcome {
    pub fn success(progress_delta: u8, next_step: impl Into<String>) -> Self {
        Self::Success(StageOutput::new(progress_delta, next_step))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(StageFailure {
            message: message.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success(_))
    }
}
