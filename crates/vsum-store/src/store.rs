//! Job record store contract.

use async_trait::async_trait;

use vsum_models::{CorrelationToken, JobId, ProcessingJob};

use crate::error::{StoreError, StoreResult};

/// Persistent home of `ProcessingJob` records.
///
/// Written by the orchestrator only, read by the orchestrator and by any
/// number of status streams. Writes are last-write-wins.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails if the id or the correlation token is taken.
    async fn insert(&self, job: &ProcessingJob) -> StoreResult<()>;

    /// Load a record by id.
    async fn get(&self, id: &JobId) -> StoreResult<Option<ProcessingJob>>;

    /// Load a record by its correlation token.
    async fn find_by_token(&self, token: &CorrelationToken) -> StoreResult<Option<ProcessingJob>>;

    /// Overwrite an existing record.
    async fn save(&self, job: &ProcessingJob) -> StoreResult<()>;

    /// Connectivity check.
    async fn ping(&self) -> StoreResult<()>;
}

/// Validate a write against the record invariants and the previous version.
///
/// Owner and correlation token are immutable once created.
pub fn check_write(previous: Option<&ProcessingJob>, next: &ProcessingJob) -> StoreResult<()> {
    next.validate()?;

    if let Some(prev) = previous {
        if prev.owner_id != next.owner_id {
            return Err(StoreError::OwnershipChange(next.id.clone()));
        }
        if prev.correlation_token != next.correlation_token {
            return Err(StoreError::TokenChange(next.id.clone()));
        }
    }
    Ok(())
}
