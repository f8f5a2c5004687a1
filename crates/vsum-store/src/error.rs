//! Store error types.

use thiserror::Error;

use vsum_models::{JobId, JobRecordError};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Transient(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Correlation token already in use: {0}")]
    TokenInUse(String),

    #[error("Owner of job {0} cannot change")]
    OwnershipChange(JobId),

    #[error("Correlation token of job {0} cannot change")]
    TokenChange(JobId),

    #[error("Invalid job record: {0}")]
    InvalidRecord(#[from] JobRecordError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Transient errors may succeed on redelivery.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Redis(_))
    }
}
