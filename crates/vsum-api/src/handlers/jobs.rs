//! Job handlers.
//!
//! Provides REST API endpoints for:
//! - Submitting a video for processing
//! - Retrying a failed job
//! - One-shot status polling for clients that cannot hold a stream

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use vsum_models::{CorrelationToken, JobId, ProcessingJob, RetryRequest, StatusEvent, StatusSnapshot, SubmitJob};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// ============================================================================
// Types
// ============================================================================

/// Body of `POST /api/jobs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    /// Video ID; also the job ID
    pub video_id: String,
    /// Source video reference
    pub video_url: String,
    /// Observer token; generated when absent
    #[serde(default)]
    pub correlation_token: Option<String>,
}

/// Body of `POST /api/jobs/{jobId}/retry`.
#[derive(Debug, Default, Deserialize)]
pub struct RetryJobRequest {
    /// Reset the retry budget before counting this retry
    #[serde(default)]
    pub force: bool,
}

/// Job summary returned by submit and retry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: String,
    /// Token to pass to the status stream
    pub correlation_token: String,
    pub retry_count: u32,
    /// The request created a new job
    pub created: bool,
    pub status: StatusEvent,
}

impl JobResponse {
    fn new(job: &ProcessingJob, created: bool) -> Self {
        Self {
            job_id: job.id.to_string(),
            correlation_token: job.correlation_token.to_string(),
            retry_count: job.retry_count,
            created,
            status: StatusEvent::from_snapshot(StatusSnapshot::from_job(job)),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a video for processing.
///
/// POST /api/jobs
///
/// Answers 201 when a job was created and 200 when the video already has one.
pub async fn submit_job(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<SubmitJobRequest>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let mut request = SubmitJob::new(JobId::from_string(body.video_id.trim()), &user.uid, body.video_url);
    if let Some(raw) = body.correlation_token.as_deref() {
        let token = CorrelationToken::parse(raw).map_err(|e| ApiError::Validation(e.to_string()))?;
        request = request.with_token(token);
    }

    let submission = state.orchestrator.submit(request).await?;
    info!(
        job_id = %submission.job.id,
        uid = %user.uid,
        created = submission.created,
        dispatched = submission.dispatched,
        "Job submitted"
    );

    let status = if submission.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(JobResponse::new(&submission.job, submission.created))))
}

/// Retry a failed job owned by the caller.
///
/// POST /api/jobs/:job_id/retry
pub async fn retry_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<String>,
    body: Option<Json<RetryJobRequest>>,
) -> ApiResult<Json<JobResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let job_id = JobId::from_string(job_id);
    let request = if body.force {
        RetryRequest::forced(job_id)
    } else {
        RetryRequest::new(job_id)
    };

    let job = state.orchestrator.retry(&request, Some(&user.uid)).await?;
    info!(
        job_id = %job.id,
        uid = %user.uid,
        retry_count = job.retry_count,
        forced = body.force,
        "Job retried"
    );

    Ok(Json(JobResponse::new(&job, false)))
}

/// Current status of a job owned by the caller.
///
/// GET /api/jobs/:job_id/status
pub async fn get_job_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<String>,
) -> ApiResult<Json<StatusEvent>> {
    let job = state
        .orchestrator
        .owned_job(&JobId::from_string(job_id), &user.uid)
        .await?;
    Ok(Json(StatusEvent::from_snapshot(StatusSnapshot::from_job(&job))))
}
