//! Pipeline metrics.

use metrics::counter;

use vsum_models::Stage;

/// Metric name constants for consistency.
pub mod names {
    /// Persisted stage transitions by source and target stage.
    pub const STAGE_TRANSITIONS_TOTAL: &str = "vsum_stage_transitions_total";

    /// Dispatches ignored because the job had moved on.
    pub const STALE_DISPATCHES_TOTAL: &str = "vsum_stale_dispatches_total";

    /// Jobs reaching `Completed`.
    pub const JOBS_COMPLETED_TOTAL: &str = "vsum_jobs_completed_total";

    /// Jobs reaching `Failed`, by the stage that failed.
    pub const JOBS_FAILED_TOTAL: &str = "vsum_jobs_failed_total";

    /// Retry requests by result.
    pub const RETRIES_TOTAL: &str = "vsum_retries_total";

    /// Cleanup runs by result.
    pub const CLEANUPS_TOTAL: &str = "vsum_cleanups_total";
}

pub fn record_transition(from: Stage, to: Stage) {
    counter!(
        names::STAGE_TRANSITIONS_TOTAL,
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub fn record_stale_dispatch(stage: Stage) {
    counter!(names::STALE_DISPATCHES_TOTAL, "stage" => stage.as_str()).increment(1);
}

pub fn record_completed() {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
}

pub fn record_failed(stage: Stage) {
    counter!(names::JOBS_FAILED_TOTAL, "stage" => stage.as_str()).increment(1);
}

/// `result` is one of `accepted`, `exhausted`, `invalid_state`.
pub fn record_retry(result: &'static str) {
    counter!(names::RETRIES_TOTAL, "result" => result).increment(1);
}

/// `result` is one of `removed`, `absent`, `error`, `rejected`, `superseded`.
pub fn record_cleanup(result: &'static str) {
    counter!(names::CLEANUPS_TOTAL, "result" => result).increment(1);
}
