//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the Prometheus recorder and return the handle `/metrics` renders.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "cgen_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "cgen_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "cgen_http_requests_in_flight";

    // Streaming metrics
    pub const STREAMS_OPENED_TOTAL: &str = "cgen_streams_opened_total";
    pub const STREAMS_ACTIVE: &str = "cgen_streams_active";

    // Queue metrics
    pub const QUEUE_LENGTH: &str = "cgen_queue_length";
    pub const QUEUE_DLQ_LENGTH: &str = "cgen_queue_dlq_length";
}

/// Record an HTTP request. `route` is the matched route template so ids
/// never end up in label values.
pub fn record_http_request(method: &str, route: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", route.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a progress stream being opened (`sse` or `ws`).
pub fn record_stream_opened(transport: &'static str) {
    counter!(names::STREAMS_OPENED_TOTAL, "transport" => transport).increment(1);
    gauge!(names::STREAMS_ACTIVE, "transport" => transport).increment(1.0);
}

pub fn record_stream_closed(transport: &'static str) {
    gauge!(names::STREAMS_ACTIVE, "transport" => transport).decrement(1.0);
}

/// Update queue length gauge.
pub fn set_queue_length(length: u64) {
    gauge!(names::QUEUE_LENGTH).set(length as f64);
}

/// Update DLQ length gauge.
pub fn set_dlq_length(length: u64) {
    gauge!(names::QUEUE_DLQ_LENGTH).set(length as f64);
}

/// Label for a request: its route template, or a fixed bucket for 404s.
fn route_label(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string())
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let route = route_label(&request);
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &route, status, duration);

    response
}
