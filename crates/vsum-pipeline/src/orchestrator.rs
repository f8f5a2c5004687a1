//! Job orchestrator.
//!
//! Drives a `ProcessingJob` from `Pending` to a terminal stage, one stage at a
//! time. Every transition is persisted before the next trigger is dispatched,
//! and every dispatch is keyed on `(job_id, stage, attempt)`: a dispatch that
//! no longer matches the persisted record is a no-op. Duplicate delivery is
//! therefore harmless and no lock is taken.

use std::sync::Arc;

use tracing::Instrument;

use vsum_models::{
    CleanupRequest, CorrelationToken, JobId, ProcessingJob, RetryRequest, Stage, StageOutcome,
    SubmitJob,
};
use vsum_queue::{PipelineMessage, StageDispatch};
use vsum_store::{JobStore, StoreError};

use crate::cleanup::{CleanupOutcome, CleanupTask};
use crate::config::PipelineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::RetryController;
use crate::stage::{JobContext, StageRegistry};

/// Maximum accepted length of a job id.
const MAX_JOB_ID_LENGTH: usize = 128;

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: ProcessingJob,
    /// A new record was created
    pub created: bool,
    /// The first stage was dispatched
    pub dispatched: bool,
}

/// Result of handling a dispatch or a stage outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The job moved from one stage to another
    Advanced { from: Stage, to: Stage },
    /// The dispatch no longer matches the persisted record
    Stale { dispatched: Stage, current: Stage },
    /// No record exists for the job
    Missing,
}

/// The job state machine.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    executors: StageRegistry,
    retries: RetryController,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        config: PipelineConfig,
    ) -> Self {
        let retries = RetryController::new(store.clone(), dispatcher.clone(), config.max_retries);
        Self {
            store,
            dispatcher,
            executors: StageRegistry::new(),
            retries,
            config,
        }
    }

    /// Attach the stage executors. Only workers that run stages need them.
    pub fn with_executors(mut self, executors: StageRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a job for a video and dispatch its first stage.
    ///
    /// A job that already exists is reported as-is: a `Pending` job has its
    /// first stage dispatched again, a terminal job is left untouched (use
    /// retry), and a job with an attempt in flight is rejected.
    pub async fn submit(&self, request: SubmitJob) -> PipelineResult<Submission> {
        validate_job_id(&request.job_id)?;
        if request.owner_id.trim().is_empty() {
            return Err(PipelineError::invalid_request("owner is required"));
        }
        if request.video_url.trim().is_empty() {
            return Err(PipelineError::invalid_request("video URL is required"));
        }

        if let Some(existing) = self.store.get(&request.job_id).await? {
            return self.resubmit(existing, &request).await;
        }

        let token = request
            .correlation_token
            .clone()
            .unwrap_or_else(CorrelationToken::generate);
        let job = ProcessingJob::new(
            request.job_id.clone(),
            request.owner_id.clone(),
            request.video_url.clone(),
            token,
        );

        match self.store.insert(&job).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                // Lost a race with a concurrent submission
                let existing = self
                    .store
                    .get(&job.id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound(job.id.clone()))?;
                return self.resubmit(existing, &request).await;
            }
            Err(StoreError::TokenInUse(_)) => {
                return Err(PipelineError::invalid_request(
                    "correlation token is already in use",
                ));
            }
            Err(e) => return Err(e.into()),
        }

        JobLogger::new(&job.id, "submit").log_start("job created");
        self.dispatch_stage(&job, Stage::first()).await?;

        Ok(Submission {
            job,
            created: true,
            dispatched: true,
        })
    }

    async fn resubmit(
        &self,
        existing: ProcessingJob,
        request: &SubmitJob,
    ) -> PipelineResult<Submission> {
        if !existing.is_owned_by(&request.owner_id) {
            return Err(PipelineError::NotFound(existing.id));
        }

        match existing.stage {
            Stage::Pending => {
                self.dispatch_stage(&existing, Stage::first()).await?;
                Ok(Submission {
                    job: existing,
                    created: false,
                    dispatched: true,
                })
            }
            stage if stage.is_in_flight() => Err(PipelineError::AlreadyInFlight {
                job_id: existing.id,
                stage,
            }),
            _ => Ok(Submission {
                job: existing,
                created: false,
                dispatched: false,
            }),
        }
    }

    /// Run the stage named by a dispatch and advance the job with its outcome.
    pub async fn handle_dispatch(&self, dispatch: &StageDispatch) -> PipelineResult<AdvanceOutcome> {
        let log = JobLogger::new(&dispatch.job_id, "run_stage");

        if !dispatch.stage.is_executable() {
            return Err(PipelineError::InvalidState {
                job_id: dispatch.job_id.clone(),
                stage: dispatch.stage,
                expected: "an executable stage",
            });
        }

        let Some(mut job) = self.store.get(&dispatch.job_id).await? else {
            log.log_warning("dispatch for unknown job");
            return Ok(AdvanceOutcome::Missing);
        };

        if dispatch.attempt != job.attempt {
            return self.stale(&job, dispatch, &log).await;
        }

        if job.stage == Stage::Pending && dispatch.stage == Stage::first() {
            job.enter(dispatch.stage);
            job.current_step = dispatch.stage.label().to_string();
            self.store.save(&job).await?;
            log.log_transition(Stage::Pending, dispatch.stage, job.progress);
            metrics::record_transition(Stage::Pending, dispatch.stage);
        } else if job.stage != dispatch.stage {
            return self.stale(&job, dispatch, &log).await;
        }

        let ctx = JobContext::new(&job, dispatch.stage, self.config.job_work_dir(&job.id));
        let outcome = self
            .executors
            .execute(&ctx)
            .instrument(log.create_span())
            .await;

        self.advance(&job.id, dispatch.stage, outcome).await
    }

    async fn stale(
        &self,
        job: &ProcessingJob,
        dispatch: &StageDispatch,
        log: &JobLogger,
    ) -> PipelineResult<AdvanceOutcome> {
        log.log_stale(dispatch.stage, job.stage);
        metrics::record_stale_dispatch(dispatch.stage);

        // Redelivery of the stage just before the current one means the
        // current stage's trigger may never have been enqueued
        if dispatch.attempt == job.attempt
            && job.stage.is_in_flight()
            && dispatch.stage.next() == Some(job.stage)
        {
            self.dispatch_stage(job, job.stage).await?;
        }

        Ok(AdvanceOutcome::Stale {
            dispatched: dispatch.stage,
            current: job.stage,
        })
    }

    /// Apply a stage outcome to the job that owns `stage`.
    ///
    /// Success raises progress, records artifacts and warnings, and moves the
    /// job to the next stage (dispatching it) or to `Completed`. Failure moves
    /// the job to `Failed`. Both terminal stages schedule cleanup.
    pub async fn advance(
        &self,
        job_id: &JobId,
        stage: Stage,
        outcome: StageOutcome,
    ) -> PipelineResult<AdvanceOutcome> {
        let log = JobLogger::new(job_id, "advance");

        let Some(mut job) = self.store.get(job_id).await? else {
            log.log_warning("stage outcome for unknown job");
            return Ok(AdvanceOutcome::Missing);
        };

        if job.stage != stage {
            log.log_stale(stage, job.stage);
            metrics::record_stale_dispatch(stage);
            return Ok(AdvanceOutcome::Stale {
                dispatched: stage,
                current: job.stage,
            });
        }

        let Some(next) = stage.next().filter(|_| stage.is_executable()) else {
            return Err(PipelineError::InvalidState {
                job_id: job.id,
                stage,
                expected: "an executable stage",
            });
        };

        match outcome {
            StageOutcome::Success(output) => {
                job.raise_progress(job.progress.saturating_add(output.progress_delta));
                job.record_artifacts(stage, output.artifacts);
                for warning in &output.warnings {
                    log.log_warning(warning);
                }
                job.warnings.extend(output.warnings);

                if next == Stage::Completed {
                    job.complete();
                } else {
                    job.current_step = output.next_step;
                    job.enter(next);
                }

                self.store.save(&job).await?;
                log.log_transition(stage, next, job.progress);
                metrics::record_transition(stage, next);

                if next == Stage::Completed {
                    log.log_completion("all stages finished");
                    metrics::record_completed();
                    self.schedule_cleanup(&job).await;
                } else {
                    self.dispatch_stage(&job, next).await?;
                }

                Ok(AdvanceOutcome::Advanced { from: stage, to: next })
            }
            StageOutcome::Failure(failure) => {
                let message = if failure.message.trim().is_empty() {
                    format!("{} failed", stage.label())
                } else {
                    failure.message
                };
                job.fail(message.clone());

                self.store.save(&job).await?;
                log.log_error(&message);
                log.log_transition(stage, Stage::Failed, job.progress);
                metrics::record_transition(stage, Stage::Failed);
                metrics::record_failed(stage);

                self.schedule_cleanup(&job).await;

                Ok(AdvanceOutcome::Advanced {
                    from: stage,
                    to: Stage::Failed,
                })
            }
        }
    }

    /// Fail a job that is stuck in an in-flight stage (e.g. its trigger was
    /// dead-lettered). A no-op for any other stage.
    pub async fn abandon(
        &self,
        dispatch: &StageDispatch,
        reason: &str,
    ) -> PipelineResult<AdvanceOutcome> {
        self.advance(&dispatch.job_id, dispatch.stage, StageOutcome::failure(reason))
            .await
    }

    /// Reopen a failed job and dispatch its first stage again.
    pub async fn retry(
        &self,
        request: &RetryRequest,
        owner_id: Option<&str>,
    ) -> PipelineResult<ProcessingJob> {
        self.retries.retry(request, owner_id).await
    }

    /// Load a job visible to `owner_id`. Absent and foreign jobs are both `NotFound`.
    pub async fn owned_job(&self, job_id: &JobId, owner_id: &str) -> PipelineResult<ProcessingJob> {
        self.store
            .get(job_id)
            .await?
            .filter(|job| job.is_owned_by(owner_id))
            .ok_or_else(|| PipelineError::NotFound(job_id.clone()))
    }

    /// Carry out a cleanup request unless the job has moved on since it was
    /// scheduled.
    ///
    /// The directory belongs to the attempt that scheduled the cleanup only
    /// while the job is still terminal on that attempt. A retry accepted in
    /// between reuses the directory, so the request is skipped. Requests for
    /// jobs that no longer exist still run.
    pub async fn cleanup(
        &self,
        task: &CleanupTask,
        request: &CleanupRequest,
    ) -> PipelineResult<CleanupOutcome> {
        if let Some(job) = self.store.get(&request.job_id).await? {
            if !job.is_terminal() || job.attempt != request.attempt {
                JobLogger::new(&job.id, "cleanup").log_warning(&format!(
                    "Skipping cleanup for attempt {}: job is on attempt {} in stage {}",
                    request.attempt, job.attempt, job.stage
                ));
                metrics::record_cleanup("superseded");
                return Ok(CleanupOutcome::Superseded);
            }
        }
        Ok(task.run(request).await)
    }

    async fn dispatch_stage(&self, job: &ProcessingJob, stage: Stage) -> PipelineResult<()> {
        let dispatch = StageDispatch::new(job.id.clone(), stage, job.attempt);
        self.dispatcher
            .dispatch(PipelineMessage::RunStage(dispatch))
            .await
    }

    async fn schedule_cleanup(&self, job: &ProcessingJob) {
        let request =
            CleanupRequest::new(job.id.clone(), self.config.job_work_dir(&job.id), job.attempt);
        if let Err(e) = self
            .dispatcher
            .dispatch(PipelineMessage::Cleanup(request))
            .await
        {
            JobLogger::new(&job.id, "cleanup")
                .log_warning(&format!("Failed to schedule cleanup: {}", e));
        }
    }
}

/// Job ids double as working-directory names.
fn validate_job_id(id: &JobId) -> PipelineResult<()> {
    let raw = id.as_str();
    if raw.is_empty() || raw.len() > MAX_JOB_ID_LENGTH {
        return Err(PipelineError::invalid_request("job id must be 1-128 characters"));
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PipelineError::invalid_request(
            "job id may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use vsum_models::{Artifact, StageOutput, StatusSnapshot};
    use vsum_store::MemoryJobStore;

    use super::*;
    use crate::dispatcher::RecordingDispatcher;
    use crate::stage::StageExecutor;

    /// Executor returning a scripted outcome per stage and counting runs.
    #[derive(Default)]
    pub(crate) struct Scripted {
        outcomes: Mutex<HashMap<Stage, StageOutcome>>,
        runs: AtomicUsize,
    }

    impl Scripted {
        pub(crate) fn set(&self, stage: Stage, outcome: StageOutcome) {
            self.outcomes.lock().unwrap().insert(stage, outcome);
        }

        pub(crate) fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageExecutor for Scripted {
        async fn execute(&self, ctx: &JobContext) -> StageOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .get(&ctx.stage)
                .cloned()
                .unwrap_or_else(|| StageOutcome::success(20, format!("after {}", ctx.stage)))
        }
    }

    pub(crate) struct Harness {
        pub store: Arc<MemoryJobStore>,
        pub dispatcher: Arc<RecordingDispatcher>,
        pub executor: Arc<Scripted>,
        pub orchestrator: Orchestrator,
    }

    pub(crate) fn harness_with(config: PipelineConfig) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let executor = Arc::new(Scripted::default());
        let registry = Stage::EXECUTABLE.iter().fold(StageRegistry::new(), |r, s| {
            r.register(*s, executor.clone() as Arc<dyn StageExecutor>)
        });
        let orchestrator = Orchestrator::new(store.clone(), dispatcher.clone(), config)
            .with_executors(registry);
        Harness {
            store,
            dispatcher,
            executor,
            orchestrator,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(PipelineConfig::default())
    }

    pub(crate) fn submit_request(id: &str) -> SubmitJob {
        SubmitJob::new(JobId::from_string(id), "alice", "https://example.com/v.mp4")
    }

    impl Harness {
        /// Run queued stage dispatches until none are left, recording the
        /// persisted stage after each one.
        pub(crate) async fn drain(&self) -> Vec<Stage> {
            let mut stages = Vec::new();
            loop {
                let runs: Vec<StageDispatch> = self
                    .dispatcher
                    .drain()
                    .into_iter()
                    .filter_map(|m| match m {
                        PipelineMessage::RunStage(d) => Some(d),
                        _ => None,
                    })
                    .collect();
                if runs.is_empty() {
                    return stages;
                }
                for dispatch in runs {
                    self.orchestrator.handle_dispatch(&dispatch).await.unwrap();
                    let job = self.store.get(&dispatch.job_id).await.unwrap().unwrap();
                    stages.push(job.stage);
                }
            }
        }

        pub(crate) async fn job(&self, id: &str) -> ProcessingJob {
            self.store
                .get(&JobId::from_string(id))
                .await
                .unwrap()
                .unwrap()
        }
    }

    fn is_forward_chain(stages: &[Stage]) -> bool {
        stages
            .windows(2)
            .all(|w| w[0] == w[1] || w[0].can_transition_to(w[1]))
    }

    #[tokio::test]
    async fn test_submit_runs_all_stages_to_completion() {
        let h = harness();
        let submission = h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        assert!(submission.created && submission.dispatched);
        assert_eq!(submission.job.stage, Stage::Pending);

        let stages = h.drain().await;
        assert_eq!(
            stages,
            vec![
                Stage::ExtractingKeyframes,
                Stage::UploadingAssets,
                Stage::GeneratingSummary,
                Stage::Completed
            ]
        );
        assert!(is_forward_chain(&stages));
        assert_eq!(h.executor.runs(), 4);

        let job = h.job("video-1").await;
        assert_eq!(job.stage, Stage::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.error.is_none());
        assert_eq!(StatusSnapshot::from_job(&job).completed_steps.len(), 4);
    }

    #[tokio::test]
    async fn test_completion_schedules_cleanup_once() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();

        // Drain manually so cleanup messages are visible
        let mut cleanups = Vec::new();
        loop {
            let messages = h.dispatcher.drain();
            if messages.is_empty() {
                break;
            }
            for message in messages {
                match message {
                    PipelineMessage::RunStage(d) => {
                        h.orchestrator.handle_dispatch(&d).await.unwrap();
                    }
                    PipelineMessage::Cleanup(c) => cleanups.push(c),
                    PipelineMessage::Retry(_) => unreachable!(),
                }
            }
        }

        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].job_id.as_str(), "video-1");
        assert!(cleanups[0].work_dir.ends_with("video-1"));
    }

    #[tokio::test]
    async fn test_stage_failure_marks_job_failed() {
        let h = harness();
        h.executor
            .set(Stage::UploadingAssets, StageOutcome::failure("bucket unreachable"));
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();

        let stages = h.drain().await;
        assert_eq!(stages.last(), Some(&Stage::Failed));
        assert!(is_forward_chain(&stages));
        assert_eq!(h.executor.runs(), 3);

        let job = h.job("video-1").await;
        assert_eq!(job.error.as_deref(), Some("bucket unreachable"));
        assert_eq!(job.failed_stage, Some(Stage::UploadingAssets));
        assert_eq!(
            StatusSnapshot::from_job(&job).completed_steps,
            vec![
                Stage::ExtractingTranscript.label().to_string(),
                Stage::ExtractingKeyframes.label().to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_redelivered_dispatch_is_noop() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        let first = match h.dispatcher.drain().pop() {
            Some(PipelineMessage::RunStage(d)) => d,
            other => panic!("unexpected message: {:?}", other),
        };

        h.orchestrator.handle_dispatch(&first).await.unwrap();
        let before = h.job("video-1").await;
        assert_eq!(before.stage, Stage::ExtractingKeyframes);
        let runs = h.executor.runs();

        let outcome = h.orchestrator.handle_dispatch(&first).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Stale {
                dispatched: Stage::ExtractingTranscript,
                current: Stage::ExtractingKeyframes
            }
        );

        let after = h.job("video-1").await;
        assert_eq!(after.stage, before.stage);
        assert_eq!(after.progress, before.progress);
        assert_eq!(h.executor.runs(), runs);
    }

    #[tokio::test]
    async fn test_stale_outcome_does_not_alter_job() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        h.drain().await;
        let done = h.job("video-1").await;

        let outcome = h
            .orchestrator
            .advance(&done.id, Stage::ExtractingTranscript, StageOutcome::failure("late"))
            .await
            .unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Stale { .. }));
        assert_eq!(h.job("video-1").await, done);
    }

    #[tokio::test]
    async fn test_dispatch_from_previous_attempt_is_stale() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        h.dispatcher.drain();

        let old = StageDispatch::new(JobId::from_string("video-1"), Stage::first(), 7);
        let outcome = h.orchestrator.handle_dispatch(&old).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Stale { .. }));
        assert_eq!(h.job("video-1").await.stage, Stage::Pending);
        assert_eq!(h.executor.runs(), 0);
    }

    #[tokio::test]
    async fn test_submission_rejected_while_in_flight() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        let first = match h.dispatcher.drain().pop() {
            Some(PipelineMessage::RunStage(d)) => d,
            other => panic!("unexpected message: {:?}", other),
        };
        h.orchestrator.handle_dispatch(&first).await.unwrap();

        let err = h
            .orchestrator
            .submit(submit_request("video-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::AlreadyInFlight {
                stage: Stage::ExtractingKeyframes,
                ..
            }
        ));
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_resubmission_of_pending_and_terminal_jobs() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        h.dispatcher.drain();

        let again = h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        assert!(!again.created);
        assert!(again.dispatched);

        h.drain().await;
        let terminal = h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        assert!(!terminal.created);
        assert!(!terminal.dispatched);
        assert_eq!(terminal.job.stage, Stage::Completed);
        assert!(h.dispatcher.sent().is_empty());
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_resubmission_by_other_owner_is_not_found() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();

        let foreign = SubmitJob::new(JobId::from_string("video-1"), "mallory", "https://x/v.mp4");
        assert!(matches!(
            h.orchestrator.submit(foreign).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_validates_input() {
        let h = harness();
        for bad in ["", "../etc", "a/b"] {
            let request = SubmitJob::new(JobId::from_string(bad), "alice", "https://x/v.mp4");
            assert!(matches!(
                h.orchestrator.submit(request).await,
                Err(PipelineError::InvalidRequest(_))
            ));
        }
        let no_url = SubmitJob::new(JobId::from_string("video-1"), "alice", " ");
        assert!(matches!(
            h.orchestrator.submit(no_url).await,
            Err(PipelineError::InvalidRequest(_))
        ));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_supplied_correlation_token_is_kept_and_unique() {
        let h = harness();
        let token = CorrelationToken::parse("observer-token").unwrap();
        let job = h
            .orchestrator
            .submit(submit_request("video-1").with_token(token.clone()))
            .await
            .unwrap()
            .job;
        assert_eq!(job.correlation_token, token);

        let clash = submit_request("video-2").with_token(token);
        assert!(matches!(
            h.orchestrator.submit(clash).await,
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_progress_warnings_and_artifacts_accumulate() {
        let h = harness();
        h.executor.set(
            Stage::ExtractingTranscript,
            StageOutcome::Success(
                StageOutput::new(80, "Analyzing video")
                    .with_artifact(Artifact::new("transcript", "/tmp/vsum/video-1/t.json"))
                    .with_warning("Auto-generated captions used"),
            ),
        );
        h.executor.set(
            Stage::ExtractingKeyframes,
            StageOutcome::Success(StageOutput::new(80, "Uploading")),
        );
        h.executor
            .set(Stage::UploadingAssets, StageOutcome::failure("stop here"));
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        h.drain().await;

        let job = h.job("video-1").await;
        // Deltas are capped at 100 and never decrease
        assert_eq!(job.progress, 100);
        assert_eq!(job.warnings, vec!["Auto-generated captions used".to_string()]);
        assert_eq!(job.artifacts_of_kind("transcript").count(), 1);

        let snapshot = StatusSnapshot::from_job(&job);
        assert_eq!(snapshot.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_enqueue_is_repaired_by_redelivery() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        let first = match h.dispatcher.drain().pop() {
            Some(PipelineMessage::RunStage(d)) => d,
            other => panic!("unexpected message: {:?}", other),
        };
        h.orchestrator.handle_dispatch(&first).await.unwrap();
        // The follow-up trigger is lost
        h.dispatcher.drain();

        h.orchestrator.handle_dispatch(&first).await.unwrap();
        assert_eq!(
            h.dispatcher.sent(),
            vec![PipelineMessage::RunStage(StageDispatch::new(
                JobId::from_string("video-1"),
                Stage::ExtractingKeyframes,
                0
            ))]
        );
    }

    #[tokio::test]
    async fn test_cleanup_dispatch_failure_does_not_fail_transition() {
        let h = harness();
        h.executor
            .set(Stage::ExtractingTranscript, StageOutcome::failure("no captions"));
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        let first = match h.dispatcher.drain().pop() {
            Some(PipelineMessage::RunStage(d)) => d,
            other => panic!("unexpected message: {:?}", other),
        };

        h.dispatcher.set_unavailable(true);
        let outcome = h.orchestrator.handle_dispatch(&first).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Advanced {
                from: Stage::ExtractingTranscript,
                to: Stage::Failed
            }
        );
        assert_eq!(h.job("video-1").await.stage, Stage::Failed);
    }

    #[tokio::test]
    async fn test_transient_store_error_propagates() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        let first = match h.dispatcher.drain().pop() {
            Some(PipelineMessage::RunStage(d)) => d,
            other => panic!("unexpected message: {:?}", other),
        };

        h.store.set_unavailable(true);
        let err = h.orchestrator.handle_dispatch(&first).await.unwrap_err();
        assert!(err.is_retryable());

        h.store.set_unavailable(false);
        h.orchestrator.handle_dispatch(&first).await.unwrap();
        assert_eq!(h.job("video-1").await.stage, Stage::ExtractingKeyframes);
    }

    #[tokio::test]
    async fn test_owned_job_hides_foreign_jobs() {
        let h = harness();
        h.orchestrator.submit(submit_request("video-1")).await.unwrap();
        let id = JobId::from_string("video-1");

        tokio_test::assert_ok!(h.orchestrator.owned_job(&id, "alice").await);
        assert!(matches!(
            h.orchestrator.owned_job(&id, "mallory").await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator
                .owned_job(&JobId::from_string("video-2"), "alice")
                .await,
            Err(PipelineError::NotFound(_))
        ));
    }
}
