//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] vsum_queue::QueueError),

    #[error("Store error: {0}")]
    Store(#[from] vsum_store::StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] vsum_pipeline::PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether redelivering the trigger may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Pipeline(e) => e.is_retryable(),
            WorkerError::Store(e) => e.is_transient(),
            WorkerError::Queue(_) | WorkerError::Io(_) => true,
            WorkerError::ConfigError(_) => false,
        }
    }
}
