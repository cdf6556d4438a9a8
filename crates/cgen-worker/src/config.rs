//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::deadline::DeadlineGuard;
use crate::retry::RetryPolicy;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent stage invocations
    pub max_concurrent_jobs: usize,
    /// Cooperative cancellation deadline per stage
    pub soft_timeout: Duration,
    /// Forced termination deadline per stage
    pub hard_timeout: Duration,
    /// How long shutdown waits for in-flight stages
    pub shutdown_timeout: Duration,
    /// Root for per-invocation temporary directories
    pub work_dir: PathBuf,
    /// How often to scan for deliveries abandoned by crashed workers
    pub claim_interval: Duration,
    /// Minimum idle time before a delivery can be claimed. Must exceed
    /// `hard_timeout` so a live invocation is never stolen.
    pub claim_min_idle: Duration,
    /// How long one consume call blocks
    pub consume_block: Duration,
    /// Prometheus listener, disabled when unset
    pub metrics_port: Option<u16>,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            soft_timeout: Duration::from_secs(540),
            hard_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(60),
            work_dir: std::env::temp_dir().join("cgen"),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(900),
            consume_block: Duration::from_secs(1),
            metrics_port: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let soft_timeout = env_parse("WORKER_SOFT_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.soft_timeout);
        let hard_timeout = env_parse("WORKER_HARD_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.hard_timeout)
            .max(soft_timeout);

        Self {
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs)
                .max(1),
            soft_timeout,
            hard_timeout,
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_min_idle: env_parse("WORKER_CLAIM_MIN_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_min_idle)
                .max(hard_timeout),
            consume_block: defaults.consume_block,
            metrics_port: env_parse("WORKER_METRICS_PORT"),
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn deadline(&self) -> DeadlineGuard {
        DeadlineGuard::new(self.soft_timeout, self.hard_timeout)
    }
}
