//! Bounded retry of failed jobs.
//!
//! A retry is the only way back out of `Failed`. It reopens the same record
//! (never a new one), resets progress, bumps `retry_count` and dispatches the
//! first stage under a new attempt number. Attempt numbers keep growing even
//! when a forced retry resets the budget.

use std::sync::Arc;

use vsum_models::{ProcessingJob, RetryRequest, Stage};
use vsum_queue::{PipelineMessage, StageDispatch};
use vsum_store::{JobStore, StoreError};

use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::JobLogger;
use crate::metrics;

/// Retry policy with a fixed budget per job.
pub struct RetryController {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    max_retries: u32,
}

impl RetryController {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Arc<dyn Dispatcher>, max_retries: u32) -> Self {
        Self {
            store,
            dispatcher,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Retry a failed job.
    ///
    /// When `owner_id` is given, jobs owned by someone else are reported as
    /// `NotFound`. A forced retry restarts the budget before counting this
    /// retry. An exhausted budget leaves the job untouched in `Failed`.
    pub async fn retry(
        &self,
        request: &RetryRequest,
        owner_id: Option<&str>,
    ) -> PipelineResult<ProcessingJob> {
        let log = JobLogger::new(&request.job_id, "retry");

        let mut job = self
            .store
            .get(&request.job_id)
            .await?
            .filter(|job| owner_id.map_or(true, |owner| job.is_owned_by(owner)))
            .ok_or_else(|| PipelineError::NotFound(request.job_id.clone()))?;

        if job.stage != Stage::Failed {
            metrics::record_retry("invalid_state");
            return Err(PipelineError::InvalidState {
                job_id: job.id,
                stage: job.stage,
                expected: "failed",
            });
        }

        let base = if request.force {
            log.log_warning("retry budget reset by forced retry");
            0
        } else {
            job.retry_count
        };
        let next = base.saturating_add(1);

        if next > self.max_retries {
            metrics::record_retry("exhausted");
            log.log_warning(&format!(
                "retry budget exhausted ({} of {})",
                job.retry_count, self.max_retries
            ));
            return Err(PipelineError::RetryExhausted {
                job_id: job.id,
                retry_count: job.retry_count,
                max_retries: self.max_retries,
            });
        }

        job.reopen(next);
        job.validate_with_budget(self.max_retries)
            .map_err(StoreError::from)?;
        self.store.save(&job).await?;

        log.log_transition(Stage::Failed, Stage::Pending, job.progress);
        metrics::record_transition(Stage::Failed, Stage::Pending);
        metrics::record_retry("accepted");

        let dispatch = StageDispatch::new(job.id.clone(), Stage::first(), job.attempt);
        self.dispatcher
            .dispatch(PipelineMessage::RunStage(dispatch))
            .await?;

        Ok(job)
    }
}
