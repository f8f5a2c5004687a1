//! Trigger messages carried by the queue.

use serde::{Deserialize, Serialize};

use vsum_models::{CleanupRequest, JobId, RetryRequest, Stage};

/// Request to run one stage of one job.
///
/// `attempt` is the job's attempt number when the dispatch was issued. It
/// grows on every retry, so a retried job's dispatches never collide with
/// any earlier attempt's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDispatch {
    pub job_id: JobId,
    pub stage: Stage,
    #[serde(default)]
    pub attempt: u32,
}

impl StageDispatch {
    pub fn new(job_id: JobId, stage: Stage, attempt: u32) -> Self {
        Self {
            job_id,
            stage,
            attempt,
        }
    }
}

/// Message consumed by pipeline workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineMessage {
    RunStage(StageDispatch),
    Cleanup(CleanupRequest),
    Retry(RetryRequest),
}

impl PipelineMessage {
    pub fn job_id(&self) -> &JobId {
        match self {
            PipelineMessage::RunStage(d) => &d.job_id,
            PipelineMessage::Cleanup(c) => &c.job_id,
            PipelineMessage::Retry(r) => &r.job_id,
        }
    }

    /// Message kind, used for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineMessage::RunStage(_) => "run_stage",
            PipelineMessage::Cleanup(_) => "cleanup",
            PipelineMessage::Retry(_) => "retry",
        }
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        match self {
            PipelineMessage::RunStage(d) => {
                format!("stage:{}:{}:{}", d.job_id, d.stage, d.attempt)
            }
            PipelineMessage::Cleanup(c) => format!("cleanup:{}:{}", c.job_id, c.attempt),
            PipelineMessage::Retry(r) => format!("retry:{}", r.job_id),
        }
    }

    /// Whether duplicates of this message should be suppressed.
    ///
    /// Retries are explicit user actions and always go through.
    pub fn deduplicated(&self) -> bool {
        !matches!(self, PipelineMessage::Retry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_includes_attempt() {
        let first = PipelineMessage::RunStage(StageDispatch::new(
            JobId::from_string("v1"),
            Stage::ExtractingTranscript,
            0,
        ));
        let retried = PipelineMessage::RunStage(StageDispatch::new(
            JobId::from_string("v1"),
            Stage::ExtractingTranscript,
            1,
        ));
        assert_eq!(first.idempotency_key(), "stage:v1:extracting_transcript:0");
        assert_ne!(first.idempotency_key(), retried.idempotency_key());
    }

    #[test]
    fn test_message_wire_format() {
        let msg = PipelineMessage::Retry(RetryRequest::new(JobId::from_string("v1")));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "retry");
        assert_eq!(json["job_id"], "v1");

        let back: PipelineMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
        assert!(!back.deduplicated());
    }
}
