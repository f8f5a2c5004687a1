//! Observer-facing status types.
//!
//! `StatusSnapshot` is derived from a `ProcessingJob` on every read and never
//! persisted. `StatusEvent` is the JSON object pushed to stream clients.

use serde::{Deserialize, Serialize};

use crate::job::ProcessingJob;
use crate::stage::Stage;

/// Step label used for synthetic connection-error events.
pub const CONNECTION_ERROR_STEP: &str = "Status unavailable";

/// Warning attached to synthetic connection-error events.
pub const CONNECTION_ERROR_WARNING: &str =
    "Connection error while reading job status. Refresh to reconnect.";

/// Key used to suppress redundant pushes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub stage: Stage,
    pub current_step: String,
    pub progress: u8,
}

/// Derived view of a job's current progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub stage: Stage,
    pub progress: u8,
    pub current_step: String,
    pub warnings: Vec<String>,
    pub completed_steps: Vec<String>,
    pub error: Option<String>,
}

impl StatusSnapshot {
    /// Compute the snapshot for a job record.
    pub fn from_job(job: &ProcessingJob) -> Self {
        let reached = match job.stage {
            Stage::Failed => job.failed_stage.unwrap_or(Stage::Pending),
            stage => stage,
        };

        Self {
            stage: job.stage,
            progress: job.progress,
            current_step: job.current_step.clone(),
            warnings: job.warnings.clone(),
            completed_steps: reached
                .preceding()
                .iter()
                .map(|s| s.label().to_string())
                .collect(),
            error: job.error.clone(),
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            stage: self.stage,
            current_step: self.current_step.clone(),
            progress: self.progress,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Message pushed to a status stream client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Mirrors the job stage
    pub status: Stage,
    pub current_step: String,
    pub progress: u8,
    pub warnings: Vec<String>,
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on the final message before the channel ends
    #[serde(rename = "_close", default, skip_serializing_if = "Option::is_none")]
    pub close: Option<bool>,
}

impl StatusEvent {
    /// Regular (non-final) event for a snapshot.
    pub fn from_snapshot(snapshot: StatusSnapshot) -> Self {
        Self {
            status: snapshot.stage,
            current_step: snapshot.current_step,
            progress: snapshot.progress,
            warnings: snapshot.warnings,
            completed_steps: snapshot.completed_steps,
            error: snapshot.error,
            close: None,
        }
    }

    /// Final event for a terminal snapshot.
    pub fn closing(snapshot: StatusSnapshot) -> Self {
        Self {
            close: Some(true),
            ..Self::from_snapshot(snapshot)
        }
    }

    /// Synthetic final event emitted when the store cannot be read.
    pub fn connection_error() -> Self {
        Self {
            status: Stage::Failed,
            current_step: CONNECTION_ERROR_STEP.to_string(),
            progress: 0,
            warnings: vec![CONNECTION_ERROR_WARNING.to_string()],
            completed_steps: Vec::new(),
            error: None,
            close: Some(true),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.close == Some(true)
    }
}
