//! Status streaming over Server-Sent Events.
//!
//! Each connection runs its own `StatusBridge` task:
//!
//! ```text
//! Connecting -> Authorizing -> Streaming -> Closed
//! ```
//!
//! While streaming, the bridge re-reads the job once per poll interval and
//! pushes a `StatusEvent` whenever the dedup key changes. A terminal stage
//! produces one final event flagged `_close` and ends the stream. Client
//! disconnect and store read failures also end it. The poll timer is owned by
//! the task, so it is released on every exit path, and no read is issued once
//! the bridge has returned.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use vsum_models::{CorrelationToken, DedupKey, JobId, ProcessingJob, StatusEvent, StatusSnapshot};
use vsum_store::JobStore;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Events buffered between the bridge task and the response body.
const EVENT_BUFFER: usize = 8;

/// Per-connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authorizing,
    Streaming,
    Closed,
}

/// Why a stream reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The job reached `Completed` or `Failed`
    Terminal,
    /// The client went away
    Cancelled,
    /// The store could not be read
    ReadFailed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Terminal => "terminal",
            CloseReason::Cancelled => "cancelled",
            CloseReason::ReadFailed => "read_failed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status stream connection.
pub struct StatusBridge {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
    state: ConnectionState,
    last_key: Option<DedupKey>,
}

impl StatusBridge {
    /// Create a bridge in `Connecting`.
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        debug!(state = ?ConnectionState::Connecting, "Status stream connecting");
        Self {
            store,
            poll_interval,
            state: ConnectionState::Connecting,
            last_key: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn enter(&mut self, next: ConnectionState) {
        debug!(from = ?self.state, to = ?next, "Status stream state change");
        self.state = next;
    }

    /// Resolve the job behind `token` for `owner_id`.
    ///
    /// A missing job and a job owned by someone else produce the same error.
    pub async fn authorize(&mut self, token: Option<&str>, owner_id: &str) -> ApiResult<ProcessingJob> {
        self.enter(ConnectionState::Authorizing);
        let result = self.resolve(token, owner_id).await;
        if result.is_err() {
            self.enter(ConnectionState::Closed);
        }
        result
    }

    async fn resolve(&self, token: Option<&str>, owner_id: &str) -> ApiResult<ProcessingJob> {
        let raw = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::bad_request("token is required"))?;
        let token = CorrelationToken::parse(raw).map_err(|e| ApiError::bad_request(e.to_string()))?;

        self.store
            .find_by_token(&token)
            .await?
            .filter(|job| job.is_owned_by(owner_id))
            .ok_or_else(ApiError::job_not_found)
    }

    /// Stream status events for an authorized job into `sink` until closed.
    pub async fn run(mut self, job: ProcessingJob, sink: mpsc::Sender<StatusEvent>) -> CloseReason {
        metrics::record_stream_opened();
        let _active = scopeguard::guard((), |_| metrics::record_stream_released());

        self.enter(ConnectionState::Streaming);
        let reason = self.stream(job, &sink).await;
        self.enter(ConnectionState::Closed);

        metrics::record_stream_closed(reason.as_str());
        reason
    }

    async fn stream(&mut self, job: ProcessingJob, sink: &mpsc::Sender<StatusEvent>) -> CloseReason {
        let job_id = job.id.clone();
        if let Some(reason) = self.publish(StatusSnapshot::from_job(&job), sink).await {
            info!(job_id = %job_id, reason = %reason, "Status stream closed");
            return reason;
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let reason = loop {
            tokio::select! {
                biased;
                _ = sink.closed() => break CloseReason::Cancelled,
                _ = ticker.tick() => {}
            }

            let snapshot = tokio::select! {
                biased;
                _ = sink.closed() => break CloseReason::Cancelled,
                read = self.read(&job_id) => read,
            };

            let reason = match snapshot {
                Some(snapshot) => self.publish(snapshot, sink).await,
                None => Some(self.fail(sink).await),
            };
            if let Some(reason) = reason {
                break reason;
            }
        };

        info!(job_id = %job_id, reason = %reason, "Status stream closed");
        reason
    }

    /// Read the job once, bounded by the poll interval.
    async fn read(&self, job_id: &JobId) -> Option<StatusSnapshot> {
        match tokio::time::timeout(self.poll_interval, self.store.get(job_id)).await {
            Ok(Ok(Some(job))) => Some(StatusSnapshot::from_job(&job)),
            Ok(Ok(None)) => {
                warn!(job_id = %job_id, "Job disappeared while streaming");
                metrics::record_read_failure("missing");
                None
            }
            Ok(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "Failed to read job status");
                metrics::record_read_failure("error");
                None
            }
            Err(_) => {
                warn!(job_id = %job_id, "Job status read timed out");
                metrics::record_read_failure("timeout");
                None
            }
        }
    }

    /// Push a snapshot if it differs from the last one. Returns a close
    /// reason once the stream must end.
    async fn publish(
        &mut self,
        snapshot: StatusSnapshot,
        sink: &mpsc::Sender<StatusEvent>,
    ) -> Option<CloseReason> {
        if snapshot.is_terminal() {
            return Some(if send(sink, StatusEvent::closing(snapshot), "final").await {
                CloseReason::Terminal
            } else {
                CloseReason::Cancelled
            });
        }

        let key = snapshot.dedup_key();
        if self.last_key.as_ref() == Some(&key) {
            return None;
        }
        self.last_key = Some(key);

        if send(sink, StatusEvent::from_snapshot(snapshot), "update").await {
            None
        } else {
            Some(CloseReason::Cancelled)
        }
    }

    async fn fail(&mut self, sink: &mpsc::Sender<StatusEvent>) -> CloseReason {
        if send(sink, StatusEvent::connection_error(), "connection_error").await {
            CloseReason::ReadFailed
        } else {
            CloseReason::Cancelled
        }
    }
}

async fn send(sink: &mpsc::Sender<StatusEvent>, event: StatusEvent, kind: &'static str) -> bool {
    let sent = sink.send(event).await.is_ok();
    if sent {
        metrics::record_stream_event(kind);
    }
    sent
}

/// Query parameters of the stream endpoint.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Correlation token of the job to observe
    pub token: Option<String>,
}

fn event_stream(
    events: mpsc::Receiver<StatusEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(events, |mut events| async move {
        events.recv().await.map(|event| (event, events))
    })
    .map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    })
}

/// Status stream endpoint.
///
/// GET /api/jobs/stream?token=<correlation token>
pub async fn stream_status(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<StreamParams>,
) -> ApiResult<Response> {
    let mut bridge = StatusBridge::new(state.store.clone(), state.config.status_poll_interval);
    let job = bridge.authorize(params.token.as_deref(), &user.uid).await?;

    info!(job_id = %job.id, uid = %user.uid, "Status stream opened");

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(bridge.run(job, tx));

    let sse = Sse::new(event_stream(rx)).keep_alive(KeepAlive::default());
    let headers = [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (header::CONNECTION, HeaderValue::from_static("keep-alive")),
    ];
    Ok((headers, sse).into_response())
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinHandle;
    use vsum_models::Stage;
    use vsum_store::MemoryJobStore;

    use super::*;

    const POLL: Duration = Duration::from_secs(1);

    async fn stored_job(store: &MemoryJobStore, owner: &str, token: &str) -> ProcessingJob {
        let job = ProcessingJob::new(
            JobId::from_string("video-1"),
            owner,
            "https://example.com/v.mp4",
            CorrelationToken::parse(token).unwrap(),
        );
        store.insert(&job).await.unwrap();
        job
    }

    async fn update(store: &MemoryJobStore, f: impl FnOnce(&mut ProcessingJob)) {
        let mut job = store.get(&JobId::from_string("video-1")).await.unwrap().unwrap();
        f(&mut job);
        store.save(&job).await.unwrap();
    }

    fn start(
        store: Arc<MemoryJobStore>,
        job: ProcessingJob,
    ) -> (mpsc::Receiver<StatusEvent>, JoinHandle<CloseReason>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let bridge = StatusBridge::new(store, POLL);
        (rx, tokio::spawn(bridge.run(job, tx)))
    }

    #[tokio::test]
    async fn test_authorize_requires_token() {
        let store = Arc::new(MemoryJobStore::new());
        let mut bridge = StatusBridge::new(store, POLL);
        assert!(matches!(
            bridge.authorize(Some("   "), "alice").await,
            Err(ApiError::BadRequest(_))
        ));
        assert_eq!(bridge.state(), ConnectionState::Closed);

        let mut bridge = StatusBridge::new(Arc::new(MemoryJobStore::new()), POLL);
        assert!(matches!(bridge.authorize(None, "alice").await, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_authorize_merges_absent_and_foreign() {
        let store = Arc::new(MemoryJobStore::new());
        stored_job(&store, "alice", "tok-1").await;

        let mut bridge = StatusBridge::new(store.clone(), POLL);
        let foreign = bridge.authorize(Some("tok-1"), "bob").await.unwrap_err();
        let mut bridge = StatusBridge::new(store.clone(), POLL);
        let absent = bridge.authorize(Some("tok-2"), "bob").await.unwrap_err();
        assert_eq!(foreign.to_string(), absent.to_string());
        assert_eq!(foreign.status_code(), absent.status_code());

        let mut bridge = StatusBridge::new(store, POLL);
        let job = bridge.authorize(Some("tok-1"), "alice").await.unwrap();
        assert_eq!(job.id.as_str(), "video-1");
        assert_eq!(bridge.state(), ConnectionState::Authorizing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_event_is_immediate() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store, "alice", "tok-1").await;
        let (mut rx, _handle) = start(store.clone(), job);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, Stage::Pending);
        assert!(!event.is_closing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_status_is_pushed_once() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store, "alice", "tok-1").await;
        let (mut rx, _handle) = start(store.clone(), job);
        rx.recv().await.unwrap();

        let reads = store.read_count();
        tokio::time::sleep(POLL * 5 + POLL / 2).await;
        assert!(store.read_count() >= reads + 5);
        assert!(rx.try_recv().is_err());

        update(&store, |job| {
            job.enter(Stage::ExtractingTranscript);
            job.raise_progress(10);
        })
        .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, Stage::ExtractingTranscript);
        assert_eq!(event.progress, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_event_closes_and_stops_reads() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store, "alice", "tok-1").await;
        let (mut rx, handle) = start(store.clone(), job);
        rx.recv().await.unwrap();

        update(&store, |job| job.complete()).await;
        let last = rx.recv().await.unwrap();
        assert!(last.is_closing());
        assert_eq!(last.status, Stage::Completed);
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.await.unwrap(), CloseReason::Terminal);

        let reads = store.read_count();
        tokio::time::sleep(POLL * 10).await;
        assert_eq!(store.read_count(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_terminal_job_closes_without_polling() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = stored_job(&store, "alice", "tok-1").await;
        job.fail("transcript unavailable");
        store.save(&job).await.unwrap();

        let reads = store.read_count();
        let (mut rx, handle) = start(store.clone(), job);
        let event = rx.recv().await.unwrap();
        assert!(event.is_closing());
        assert_eq!(event.error.as_deref(), Some("transcript unavailable"));
        assert_eq!(handle.await.unwrap(), CloseReason::Terminal);

        tokio::time::sleep(POLL * 3).await;
        assert_eq!(store.read_count(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_emits_synthetic_event() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store, "alice", "tok-1").await;
        let (mut rx, handle) = start(store.clone(), job);
        rx.recv().await.unwrap();

        store.set_unavailable(true);
        let event = rx.recv().await.unwrap();
        assert_eq!(event, StatusEvent::connection_error());
        assert_eq!(event.status, Stage::Failed);
        assert_eq!(event.progress, 0);
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.await.unwrap(), CloseReason::ReadFailed);

        let reads = store.read_count();
        tokio::time::sleep(POLL * 5).await;
        assert_eq!(store.read_count(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reads_never_overlap_and_time_out_after_one_interval() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store, "alice", "tok-1").await;
        let (mut rx, handle) = start(store.clone(), job);
        rx.recv().await.unwrap();

        // Slow but within the interval: polling goes on, one read at a time
        store.set_read_delay(POLL * 3 / 4);
        tokio::time::sleep(POLL * 6).await;
        assert!(rx.try_recv().is_err());
        assert!(!handle.is_finished());
        assert_eq!(store.peak_reads_in_flight(), 1);

        // Slower than the interval: the read is abandoned and the stream ends
        store.set_read_delay(POLL * 10);
        let started = tokio::time::Instant::now();
        let event = rx.recv().await.unwrap();
        assert_eq!(event, StatusEvent::connection_error());
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.await.unwrap(), CloseReason::ReadFailed);
        assert!(started.elapsed() <= POLL * 2);
        assert_eq!(store.peak_reads_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_polling() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store, "alice", "tok-1").await;
        let (mut rx, handle) = start(store.clone(), job);
        rx.recv().await.unwrap();
        tokio::time::sleep(POLL * 2).await;

        drop(rx);
        assert_eq!(handle.await.unwrap(), CloseReason::Cancelled);

        let reads = store.read_count();
        tokio::time::sleep(POLL * 5).await;
        assert_eq!(store.read_count(), reads);
    }

    #[test]
    fn test_close_reason_labels() {
        assert_eq!(CloseReason::Terminal.to_string(), "terminal");
        assert_eq!(CloseReason::ReadFailed.as_str(), "read_failed");
    }
}
