//! Background reconciliation of jobs whose worker stopped reporting.
//!
//! Any job PROCESSING with no update for longer than the staleness threshold
//! is failed through the lifecycle, so its project or audio track fails with
//! it and connected clients receive the terminal event.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::lifecycle::JobLifecycle;
use crate::metrics;

/// Error recorded on jobs failed by the sweep.
pub const STALE_JOB_ERROR: &str = "timeout: worker stopped reporting progress";

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Must exceed the worker hard timeout.
    pub threshold: Duration,
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: Duration::from_secs(900),
            interval: Duration::from_secs(30),
        }
    }
}

impl SweeperConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("ENABLE_STALE_DETECTION")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enabled),
            threshold: std::env::var("STALE_THRESHOLD_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.threshold),
            interval: std::env::var("STALE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
        }
    }
}

pub struct StaleJobSweeper {
    lifecycle: Arc<JobLifecycle>,
    config: SweeperConfig,
}

impl StaleJobSweeper {
    pub fn new(lifecycle: Arc<JobLifecycle>, config: SweeperConfig) -> Self {
        Self { lifecycle, config }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Stale job detection is disabled");
            return;
        }

        info!(
            "Starting stale job sweeper (interval: {:?}, threshold: {:?})",
            self.config.interval, self.config.threshold
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stale job sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!("Stale job detection error: {}", e);
                    }
                }
            }
        }
    }

    /// One sweep. Returns `(stale, recovered)`.
    pub async fn check_once(&self) -> anyhow::Result<(u32, u32)> {
        let stale = self
            .lifecycle
            .store()
            .find_stale_processing(self.config.threshold)
            .await?;

        let mut recovered = 0u32;
        for job in &stale {
            warn!(
                task_id = %job.task_id,
                workspace_id = %job.workspace_id,
                kind = job.kind.as_str(),
                updated_at = %job.updated_at,
                "Detected stale job"
            );
            match self.lifecycle.fail(&job.job_ref(), STALE_JOB_ERROR).await {
                Ok(_) => recovered += 1,
                // Finished between the scan and the update
                Err(e) if e.is_invalid_state() => {}
                Err(e) => error!(task_id = %job.task_id, "Failed to recover stale job: {}", e),
            }
        }

        if !stale.is_empty() {
            metrics::record_stale_recovered(recovered);
            info!(
                "Stale job detection complete: {} stale, {} recovered",
                stale.len(),
                recovered
            );
        }
        Ok((stale.len() as u32, recovered))
    }
}
