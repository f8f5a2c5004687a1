//! Pipeline error types.

use thiserror::Error;

use vsum_models::{JobId, Stage};
use vsum_store::StoreError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {job_id} is in stage {stage}; operation requires {expected}")]
    InvalidState {
        job_id: JobId,
        stage: Stage,
        expected: &'static str,
    },

    #[error("Retry budget exhausted for job {job_id} ({retry_count} of {max_retries} used)")]
    RetryExhausted {
        job_id: JobId,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Job {job_id} already has an attempt in flight (stage {stage})")]
    AlreadyInFlight { job_id: JobId, stage: Stage },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    /// Whether the scheduler should redeliver the trigger that caused this.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_transient(),
            PipelineError::Dispatch(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::Store(StoreError::transient("down")).is_retryable());
        assert!(PipelineError::dispatch("queue down").is_retryable());
        assert!(!PipelineError::NotFound(JobId::from_string("v1")).is_retryable());
        assert!(!PipelineError::Store(StoreError::NotFound(JobId::from_string("v1"))).is_retryable());
    }
}
