//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

pub mod names {
    pub const STAGE_DURATION_SECONDS: &str = "cgen_worker_stage_duration_seconds";
    pub const STAGE_OUTCOMES_TOTAL: &str = "cgen_worker_stage_outcomes_total";
    pub const STAGES_IN_FLIGHT: &str = "cgen_worker_stages_in_flight";
    pub const DEAD_LETTERED_TOTAL: &str = "cgen_worker_dead_lettered_total";
}

/// Install the recorder and serve `/metrics` on `port`.
pub fn install_exporter(port: u16) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))
}

pub fn record_stage(stage: &str, outcome: &str, duration_secs: f64) {
    let labels = [("stage", stage.to_string()), ("outcome", outcome.to_string())];
    counter!(names::STAGE_OUTCOMES_TOTAL, &labels).increment(1);
    histogram!(names::STAGE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn set_in_flight(count: usize) {
    gauge!(names::STAGES_IN_FLIGHT).set(count as f64);
}

pub fn record_dead_lettered(stage: &str) {
    let labels = [("stage", stage.to_string())];
    counter!(names::DEAD_LETTERED_TOTAL, &labels).increment(1);
}
