//! Job lifecycle counters.

use metrics::counter;

pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "cgen_jobs_enqueued_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "cgen_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "cgen_jobs_failed_total";
    pub const JOBS_TIMED_OUT_TOTAL: &str = "cgen_jobs_timed_out_total";
    pub const JOBS_RETRIED_TOTAL: &str = "cgen_jobs_retried_total";
    pub const STALE_JOBS_RECOVERED_TOTAL: &str = "cgen_stale_jobs_recovered_total";
}

pub fn record_job_enqueued(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_ENQUEUED_TOTAL, &labels).increment(1);
}

pub fn record_job_completed(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
}

pub fn record_job_failed(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_timed_out(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_TIMED_OUT_TOTAL, &labels).increment(1);
}

pub fn record_job_retried(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_RETRIED_TOTAL, &labels).increment(1);
}

pub fn record_stale_recovered(count: u32) {
    counter!(names::STALE_JOBS_RECOVERED_TOTAL).increment(count as u64);
}
