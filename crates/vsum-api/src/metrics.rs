//! Prometheus metrics for the API server.

use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "vsum_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "vsum_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "vsum_http_requests_in_flight";

    // Status stream metrics
    pub const STATUS_STREAMS_TOTAL: &str = "vsum_status_streams_total";
    pub const STATUS_STREAMS_ACTIVE: &str = "vsum_status_streams_active";
    pub const STATUS_EVENTS_TOTAL: &str = "vsum_status_events_total";
    pub const STATUS_STREAM_CLOSES_TOTAL: &str = "vsum_status_stream_closes_total";
    pub const STATUS_READ_FAILURES_TOTAL: &str = "vsum_status_read_failures_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// A status stream entered `Streaming`.
pub fn record_stream_opened() {
    counter!(names::STATUS_STREAMS_TOTAL).increment(1);
    gauge!(names::STATUS_STREAMS_ACTIVE).increment(1.0);
}

/// A status stream released its resources.
pub fn record_stream_released() {
    gauge!(names::STATUS_STREAMS_ACTIVE).decrement(1.0);
}

/// `kind` is one of `update`, `final`, `connection_error`.
pub fn record_stream_event(kind: &'static str) {
    counter!(names::STATUS_EVENTS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_stream_closed(reason: &'static str) {
    counter!(names::STATUS_STREAM_CLOSES_TOTAL, "reason" => reason).increment(1);
}

/// `cause` is one of `error`, `timeout`, `missing`.
pub fn record_read_failure(cause: &'static str) {
    counter!(names::STATUS_READ_FAILURES_TOTAL, "cause" => cause).increment(1);
}

/// Sanitize path for metrics labels (replace job ids with a placeholder).
fn sanitize_path(path: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').collect();
    for i in 1..segments.len() {
        if segments[i - 1] == "jobs" && !segments[i].is_empty() && segments[i] != "stream" {
            segments[i] = ":job_id";
        }
    }
    segments.join("/")
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    record_http_request(&method, &path, status, start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/api/jobs/video-123/retry"), "/api/jobs/:job_id/retry");
        assert_eq!(sanitize_path("/api/jobs/abc/status"), "/api/jobs/:job_id/status");
        assert_eq!(sanitize_path("/api/jobs/stream"), "/api/jobs/stream");
        assert_eq!(sanitize_path("/api/jobs"), "/api/jobs");
        assert_eq!(sanitize_path("/health"), "/health");
    }
}
