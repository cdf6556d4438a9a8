//! Queue executor.
//!
//! Consumes stage tasks with a bounded number of concurrent invocations,
//! periodically claims deliveries abandoned by crashed workers, and moves
//! deliveries that keep failing to the dead letter queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cgen_queue::{Delivery, TaskQueue};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::orchestrator::{Orchestrator, StageOutcome};
use crate::retry::FailureTracker;

/// Most deliveries taken per consume or claim call.
const BATCH_SIZE: usize = 5;

/// Shared by every spawned invocation.
struct ExecutionContext {
    queue: Arc<dyn TaskQueue>,
    orchestrator: Orchestrator,
    max_deliveries: u32,
    /// Cancelled only once shutdown gives up waiting for in-flight stages
    stage_cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ExecutionContext {
    fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    fn spawn(self: &Arc<Self>, permit: OwnedSemaphorePermit, delivery: Delivery) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            metrics::set_in_flight(ctx.in_flight());
            ctx.execute(delivery).await;
        });
    }

    /// Run one delivery and settle it with the queue.
    async fn execute(&self, delivery: Delivery) {
        let task = &delivery.task;
        let task_id = task.task_id().clone();
        let stage = task.stage.as_str();
        let started = Instant::now();

        let result = self.orchestrator.run_task(task, &self.stage_cancel).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                let label = match &outcome {
                    StageOutcome::Completed => {
                        info!(task_id = %task_id, stage, "Task completed in {:.1}s", elapsed);
                        "completed"
                    }
                    StageOutcome::Failed(e) => {
                        info!(task_id = %task_id, stage, "Task failed: {}", e);
                        "failed"
                    }
                    StageOutcome::Skipped(reason) => {
                        debug!(task_id = %task_id, stage, "Task skipped: {}", reason);
                        "skipped"
                    }
                };
                metrics::record_stage(stage, label, elapsed);
                if let Err(e) = self.queue.ack(&delivery).await {
                    error!(task_id = %task_id, "Failed to ack delivery: {}", e);
                }
            }
            Err(WorkerError::Interrupted(e)) => {
                warn!(task_id = %task_id, stage, "Task interrupted, left for redelivery: {}", e);
                metrics::record_stage(stage, "interrupted", elapsed);
            }
            Err(e) => {
                error!(task_id = %task_id, stage, "Task errored: {}", e);
                metrics::record_stage(stage, "errored", elapsed);
                self.handle_error(&delivery, &e).await;
            }
        }
    }

    async fn handle_error(&self, delivery: &Delivery, err: &WorkerError) {
        let task_id = delivery.task.task_id();
        let deliveries = match self.queue.increment_deliveries(delivery).await {
            Ok(n) => n,
            Err(e) => {
                warn!(task_id = %task_id, "Failed to count delivery: {}", e);
                return;
            }
        };

        if deliveries < self.max_deliveries {
            info!(
                task_id = %task_id,
                "Task will be redelivered (attempt {}/{})",
                deliveries, self.max_deliveries
            );
            return;
        }

        warn!(
            task_id = %task_id,
            "Task exceeded {} deliveries, moving to DLQ",
            self.max_deliveries
        );
        let message = format!("gave up after {} deliveries: {}", deliveries, err);
        if let Err(e) = self.queue.dead_letter(delivery, &message).await {
            error!(task_id = %task_id, "Failed to move task to DLQ: {}", e);
        }
        metrics::record_dead_lettered(delivery.task.stage.as_str());

        match self
            .orchestrator
            .lifecycle()
            .fail(&delivery.task.job, &message)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_invalid_state() || e.is_not_found() => {}
            Err(e) => warn!(task_id = %task_id, "Failed to fail dead-lettered job: {}", e),
        }
    }
}

/// Consumes the stage queue and runs tasks through the orchestrator.
pub struct JobExecutor {
    config: WorkerConfig,
    ctx: Arc<ExecutionContext>,
    shutdown: CancellationToken,
    consumer_name: String,
}

impl JobExecutor {
    /// `max_deliveries` is the delivery count at which a task is dead-lettered.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Orchestrator,
        max_deliveries: u32,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let ctx = Arc::new(ExecutionContext {
            queue,
            orchestrator,
            max_deliveries: max_deliveries.max(1),
            stage_cancel: CancellationToken::new(),
            semaphore,
            max_concurrent: config.max_concurrent_jobs,
        });

        Self {
            config,
            ctx,
            shutdown: CancellationToken::new(),
            consumer_name: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Token that stops the executor when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown, then drain in-flight tasks.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.config.max_concurrent_jobs
        );

        let claim_task = tokio::spawn(Self::claim_loop(
            Arc::clone(&self.ctx),
            self.consumer_name.clone(),
            self.config.claim_interval,
            self.config.claim_min_idle,
            self.shutdown.clone(),
        ));

        let mut failures = FailureTracker::new(5);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping executor");
                    break;
                }
                result = self.consume_tasks() => match result {
                    Ok(()) => failures.record_success(),
                    Err(e) => {
                        if failures.record_failure() {
                            error!("Error consuming tasks: {}", e);
                        }
                        // Back off on error
                        tokio::select! {
                            _ = self.shutdown.cancelled() => {}
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                },
            }
        }

        claim_task.abort();
        let _ = claim_task.await;

        info!("Waiting for in-flight tasks to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_tasks())
            .await
            .is_err()
        {
            warn!(
                "{} task(s) still running after {:?}, interrupting",
                self.ctx.in_flight(),
                self.config.shutdown_timeout
            );
            self.ctx.stage_cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), self.wait_for_tasks()).await;
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Consume and dispatch up to the number of free slots.
    async fn consume_tasks(&self) -> WorkerResult<()> {
        let available = self.ctx.semaphore.available_permits();
        if available == 0 {
            // All slots busy
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .ctx
            .queue
            .consume(
                &self.consumer_name,
                self.config.consume_block,
                available.min(BATCH_SIZE),
            )
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }
        debug!("Consumed {} tasks from queue", deliveries.len());

        for delivery in deliveries {
            let Ok(permit) = Arc::clone(&self.ctx.semaphore).acquire_owned().await else {
                break;
            };
            self.ctx.spawn(permit, delivery);
        }
        Ok(())
    }

    async fn claim_loop(
        ctx: Arc<ExecutionContext>,
        consumer_name: String,
        claim_interval: Duration,
        min_idle: Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(claim_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = FailureTracker::new(3);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let claimed = match ctx.queue.claim_stale(&consumer_name, min_idle, BATCH_SIZE).await {
                Ok(claimed) => {
                    failures.record_success();
                    claimed
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Failed to claim stale tasks: {}", e);
                    }
                    continue;
                }
            };
            if claimed.is_empty() {
                continue;
            }

            info!("Claimed {} stale tasks", claimed.len());
            for delivery in claimed {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    permit = Arc::clone(&ctx.semaphore).acquire_owned() => permit,
                };
                let Ok(permit) = permit else { return };
                ctx.spawn(permit, delivery);
            }
        }
    }

    /// Wait for all in-flight tasks to complete.
    async fn wait_for_tasks(&self) {
        while self.ctx.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        metrics::set_in_flight(0);
    }
}
