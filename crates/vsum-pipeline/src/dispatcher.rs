//! Outbound trigger dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use vsum_queue::{JobQueue, PipelineMessage};

use crate::error::{PipelineError, PipelineResult};

/// Hands trigger messages to the external scheduler.
///
/// Delivery is at-least-once; implementations may suppress duplicates.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: PipelineMessage) -> PipelineResult<()>;
}

#[async_trait]
impl Dispatcher for JobQueue {
    async fn dispatch(&self, message: PipelineMessage) -> PipelineResult<()> {
        match self.enqueue(&message).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                debug!(job_id = %message.job_id(), kind = message.kind(), "Dispatch deduplicated");
                Ok(())
            }
            Err(e) => Err(PipelineError::dispatch(e.to_string())),
        }
    }
}

/// Dispatcher that records messages in memory instead of sending them.
///
/// Used by tests and by single-process runs that drain the log themselves.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<PipelineMessage>>,
    unavailable: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages dispatched so far.
    pub fn sent(&self) -> Vec<PipelineMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Remove and return every recorded message.
    pub fn drain(&self) -> Vec<PipelineMessage> {
        self.sent
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }

    /// Make every subsequent dispatch fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: PipelineMessage) -> PipelineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::dispatch("dispatcher marked unavailable"));
        }
        self.sent
            .lock()
            .map_err(|_| PipelineError::dispatch("dispatcher log poisoned"))?
            .push(message);
        Ok(())
    }
}
