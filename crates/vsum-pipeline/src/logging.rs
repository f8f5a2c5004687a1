//! Structured job logging.
//!
//! Every job-scoped event carries `job_id` and `operation` fields so one
//! job's trip through the pipeline can be followed across workers.

use tracing::{debug, error, info, warn, Span};

use vsum_models::{JobId, Stage};

/// Logger bound to one job and one operation (`submit`, `run_stage`, `retry`...).
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: &'static str,
}

impl JobLogger {
    pub fn new(job_id: &JobId, operation: &'static str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        self.operation
    }

    pub fn log_start(&self, message: &str) {
        info!(job_id = %self.job_id, operation = self.operation, "Job started: {}", message);
    }

    /// A persisted stage change.
    pub fn log_transition(&self, from: Stage, to: Stage, progress: u8) {
        info!(
            job_id = %self.job_id,
            operation = self.operation,
            from = %from,
            to = %to,
            progress,
            "Stage transition"
        );
    }

    /// A dispatch that no longer matches the persisted stage.
    pub fn log_stale(&self, dispatched: Stage, current: Stage) {
        debug!(
            job_id = %self.job_id,
            operation = self.operation,
            dispatched = %dispatched,
            current = %current,
            "Ignoring stale dispatch"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(job_id = %self.job_id, operation = self.operation, "Job warning: {}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(job_id = %self.job_id, operation = self.operation, "Job error: {}", message);
    }

    pub fn log_completion(&self, message: &str) {
        info!(job_id = %self.job_id, operation = self.operation, "Job completed: {}", message);
    }

    /// Span for work done on behalf of this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("job", job_id = %self.job_id, operation = self.operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_fields() {
        let logger = JobLogger::new(&JobId::from_string("video-1"), "run_stage");
        assert_eq!(logger.job_id(), "video-1");
        assert_eq!(logger.operation(), "run_stage");
    }
}
