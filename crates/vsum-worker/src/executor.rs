//! Trigger executor.
//!
//! Consumes pipeline messages, hands them to the orchestrator with bounded
//! concurrency, and decides per delivery whether to ack, leave it pending for
//! redelivery, or dead-letter it.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vsum_pipeline::{CleanupTask, Orchestrator, PipelineError};
use vsum_queue::{Delivery, JobQueue, PipelineMessage};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};

/// What to do with a delivery after processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done (successfully or permanently); remove from the stream
    Ack,
    /// Leave pending so it is claimed and redelivered
    Redeliver,
    /// Move to the dead letter queue
    DeadLetter,
}

impl Disposition {
    /// Decide from the processing result and the delivery counter.
    pub fn decide(result: &WorkerResult<()>, deliveries: u32, max_deliveries: u32) -> Self {
        match result {
            Ok(()) => Disposition::Ack,
            Err(e) if !e.is_retryable() => Disposition::Ack,
            Err(_) if deliveries >= max_deliveries => Disposition::DeadLetter,
            Err(_) => Disposition::Redeliver,
        }
    }
}

/// Executor that processes pipeline messages from the queue.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    orchestrator: Arc<Orchestrator>,
    cleanup: CleanupTask,
    semaphore: Arc<Semaphore>,
    shutdown: tokio::sync::watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, queue: JobQueue, orchestrator: Orchestrator) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_stages));
        let (shutdown, _) = tokio::sync::watch::channel(false);
        let cleanup = CleanupTask::new(orchestrator.config().work_dir.clone());

        Self {
            config,
            queue: Arc::new(queue),
            orchestrator: Arc::new(orchestrator),
            cleanup,
            semaphore,
            shutdown,
            consumer_name: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting executor '{}' with {} max concurrent stages",
            self.consumer_name, self.config.max_concurrent_stages
        );

        self.queue.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = self.spawn_claim_loop();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume() => {
                    if let Err(e) = result {
                        error!("Error consuming messages: {}", e);
                        // Back off on error
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight stages to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_stages())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached with stages still running");
        }

        info!("Executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn spawn_claim_loop(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let orchestrator = Arc::clone(&self.orchestrator);
        let cleanup = self.cleanup.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let consumer_name = self.consumer_name.clone();
        let claim_interval = self.config.claim_interval;
        let min_idle_ms = self.config.claim_min_idle.as_millis() as u64;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match queue.claim_pending(&consumer_name, min_idle_ms, 5).await {
                            Ok(deliveries) if !deliveries.is_empty() => {
                                info!("Claimed {} idle deliveries", deliveries.len());
                                for delivery in deliveries {
                                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                        break;
                                    };
                                    let queue = Arc::clone(&queue);
                                    let orchestrator = Arc::clone(&orchestrator);
                                    let cleanup = cleanup.clone();
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        Self::execute(queue, orchestrator, cleanup, delivery).await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim idle deliveries: {}", e),
                        }
                        Self::report_queue_depth(&queue).await;
                    }
                }
            }
        })
    }

    async fn consume(&self) -> WorkerResult<()> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            // All slots busy, wait a bit
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .queue
            .consume(
                &self.consumer_name,
                self.config.poll_block.as_millis() as u64,
                available.min(5),
            )
            .await?;

        if deliveries.is_empty() {
            return Ok(());
        }
        debug!("Consumed {} messages", deliveries.len());

        for delivery in deliveries {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::config_error("Semaphore closed"))?;
            let queue = Arc::clone(&self.queue);
            let orchestrator = Arc::clone(&self.orchestrator);
            let cleanup = self.cleanup.clone();

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute(queue, orchestrator, cleanup, delivery).await;
            });
        }

        Ok(())
    }

    /// Process one delivery and settle it with the queue.
    async fn execute(
        queue: Arc<JobQueue>,
        orchestrator: Arc<Orchestrator>,
        cleanup: CleanupTask,
        delivery: Delivery,
    ) {
        let job_id = delivery.message.job_id().clone();
        let kind = delivery.message.kind();
        let max_deliveries = queue.max_deliveries();

        // Poison messages that keep crashing workers never reach the orchestrator
        let result = if delivery.deliveries > max_deliveries {
            Err(WorkerError::Pipeline(PipelineError::dispatch(format!(
                "delivered {} times",
                delivery.deliveries
            ))))
        } else {
            process_message(&orchestrator, &cleanup, &delivery.message).await
        };

        let disposition = Disposition::decide(&result, delivery.deliveries, max_deliveries);
        counter!(
            "vsum_worker_messages_total",
            "kind" => kind,
            "disposition" => format!("{:?}", disposition).to_lowercase()
        )
        .increment(1);

        match (disposition, result) {
            (Disposition::Ack, result) => {
                if let Err(e) = result {
                    warn!(job_id = %job_id, kind, "Dropping message after permanent error: {}", e);
                }
                if let Err(e) = queue.ack(&delivery.message_id).await {
                    error!(job_id = %job_id, "Failed to ack message: {}", e);
                }
            }
            (Disposition::Redeliver, Err(e)) => {
                info!(
                    job_id = %job_id,
                    kind,
                    "Message will be redelivered (delivery {}/{}): {}",
                    delivery.deliveries,
                    max_deliveries,
                    e
                );
            }
            (Disposition::DeadLetter, result) => {
                let reason = match result {
                    Err(e) => e.to_string(),
                    Ok(()) => "unknown".to_string(),
                };
                if let Err(e) = queue.dlq(&delivery, &reason).await {
                    error!(job_id = %job_id, "Failed to move message to DLQ: {}", e);
                }
                if let PipelineMessage::RunStage(dispatch) = &delivery.message {
                    let message = format!(
                        "{} could not be run after {} attempts: {}",
                        dispatch.stage.label(),
                        delivery.deliveries,
                        reason
                    );
                    if let Err(e) = orchestrator.abandon(dispatch, &message).await {
                        error!(job_id = %job_id, "Failed to fail dead-lettered job: {}", e);
                    }
                }
            }
            (Disposition::Redeliver, Ok(())) => {}
        }
    }

    async fn wait_for_stages(&self) {
        loop {
            if self.semaphore.available_permits() == self.config.max_concurrent_stages {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn report_queue_depth(queue: &JobQueue) {
        if let Ok(len) = queue.len().await {
            gauge!("vsum_queue_length").set(len as f64);
        }
        if let Ok(len) = queue.dlq_len().await {
            gauge!("vsum_queue_dlq_length").set(len as f64);
        }
    }
}

/// Route one message to the orchestrator or the cleanup task.
pub async fn process_message(
    orchestrator: &Orchestrator,
    cleanup: &CleanupTask,
    message: &PipelineMessage,
) -> WorkerResult<()> {
    match message {
        PipelineMessage::RunStage(dispatch) => {
            orchestrator.handle_dispatch(dispatch).await?;
        }
        PipelineMessage::Cleanup(request) => {
            orchestrator.cleanup(cleanup, request).await?;
        }
        PipelineMessage::Retry(request) => match orchestrator.retry(request, None).await {
            Ok(_) => {}
            Err(
                e @ (PipelineError::RetryExhausted { .. }
                | PipelineError::InvalidState { .. }
                | PipelineError::NotFound(_)),
            ) => {
                warn!(job_id = %request.job_id, "Retry trigger rejected: {}", e);
            }
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}
