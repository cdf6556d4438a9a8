//! Job state machine operations.
//!
//! Every mutation goes through the guarded store transitions and publishes
//! a progress event keyed by task id. Publishing is best effort and bounded
//! by a short timeout, so a slow bus never stalls a stage.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use cgen_models::{
    GenerationJob, JobKind, JobRef, JobStatus, NewJob, ProgressEvent, ProjectId, RetryOutcome,
    ScriptBundle, Video, VideoAudioTrack, VideoProject,
};
use cgen_queue::{
    publish_best_effort, EventStream, ProgressBus, Stage, StageTask, TaskQueue,
    DEFAULT_PUBLISH_TIMEOUT,
};
use cgen_store::Store;

use crate::error::JobResult;
use crate::metrics;

/// Prefix that marks a failure as a timeout rather than a stage error.
pub const TIMEOUT_PREFIX: &str = "timeout:";

/// A job snapshot paired with a live subscription opened before it was read.
pub struct JobWatch {
    pub snapshot: GenerationJob,
    pub events: EventStream,
}

/// Store, queue and bus handles behind the job state machine.
#[derive(Clone)]
pub struct JobLifecycle {
    store: Store,
    queue: Arc<dyn TaskQueue>,
    bus: Arc<dyn ProgressBus>,
    publish_timeout: Duration,
}

impl JobLifecycle {
    pub fn new(store: Store, queue: Arc<dyn TaskQueue>, bus: Arc<dyn ProgressBus>) -> Self {
        Self {
            store,
            queue,
            bus,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<dyn ProgressBus> {
        &self.bus
    }

    async fn publish(&self, event: ProgressEvent) {
        publish_best_effort(self.bus.as_ref(), &event, self.publish_timeout).await;
    }

    /// Enqueue the stage task for `job`, failing the job if the queue is down
    /// so it never sits PENDING with no task behind it.
    ///
    /// The "queued" event goes out before the task is visible to workers, so
    /// it can never trail the PROCESSING event of the worker that takes it.
    async fn enqueue(&self, job: &GenerationJob) -> JobResult<()> {
        let task = StageTask::new(
            Stage::for_kind(job.kind),
            job.job_ref(),
            job.retry_count,
            job.generation_config.clone(),
        );
        self.publish(ProgressEvent::new(
            job.task_id.clone(),
            JobStatus::Pending,
            0,
            "queued",
        ))
        .await;

        match self.queue.enqueue(&task).await {
            Ok(message_id) => {
                debug!(task_id = %job.task_id, message_id = %message_id, "Stage task enqueued");
            }
            Err(e) if e.is_duplicate() => {
                debug!(task_id = %job.task_id, "Stage task already queued");
            }
            Err(e) => {
                warn!(task_id = %job.task_id, "Failed to enqueue stage task: {}", e);
                let message = format!("enqueue failed: {}", e);
                if let Err(fail_err) = self.fail(&job.job_ref(), &message).await {
                    warn!(task_id = %job.task_id, "Failed to mark unqueued job failed: {}", fail_err);
                }
                return Err(e.into());
            }
        }
        metrics::record_job_enqueued(job.kind.as_str());
        Ok(())
    }

    /// Insert a PENDING job and enqueue its stage task.
    pub async fn create(&self, job: &NewJob) -> JobResult<GenerationJob> {
        let job = self.store.insert_job(job).await?;
        info!(
            task_id = %job.task_id,
            workspace_id = %job.workspace_id,
            kind = job.kind.as_str(),
            "Created generation job"
        );
        self.enqueue(&job).await?;
        Ok(job)
    }

    /// Insert a video project and its script job together, then enqueue.
    pub async fn create_project(
        &self,
        project: &VideoProject,
        job: &NewJob,
    ) -> JobResult<GenerationJob> {
        let job = self.store.create_project_with_job(project, job).await?;
        info!(
            task_id = %job.task_id,
            project_id = %project.id,
            workspace_id = %job.workspace_id,
            "Created video project"
        );
        self.enqueue(&job).await?;
        Ok(job)
    }

    /// Insert an audio track and its regeneration job together, then enqueue.
    pub async fn create_audio(
        &self,
        track: &VideoAudioTrack,
        job: &NewJob,
    ) -> JobResult<GenerationJob> {
        let job = self.store.create_audio_job(track, job).await?;
        info!(
            task_id = %job.task_id,
            video_id = %track.video_id,
            audio_track_id = %track.id,
            "Created audio regeneration job"
        );
        self.enqueue(&job).await?;
        Ok(job)
    }

    pub async fn get(&self, job_ref: &JobRef) -> JobResult<GenerationJob> {
        Ok(self.store.get_job(job_ref).await?)
    }

    /// Subscribe first, then read the snapshot, so no event published in
    /// between can be missed.
    pub async fn watch(&self, job_ref: &JobRef) -> JobResult<JobWatch> {
        let events = self.bus.subscribe(&job_ref.task_id).await?;
        let snapshot = self.store.get_job(job_ref).await?;
        Ok(JobWatch { snapshot, events })
    }

    /// PENDING -> PROCESSING. Idempotent for a job already PROCESSING.
    pub async fn start(&self, job_ref: &JobRef) -> JobResult<GenerationJob> {
        let job = self.store.mark_started(job_ref).await?;
        self.publish(ProgressEvent::new(
            job.task_id.clone(),
            JobStatus::Processing,
            job.progress,
            job.current_step.clone().unwrap_or_else(|| "started".to_string()),
        ))
        .await;
        Ok(job)
    }

    /// Record progress of a PROCESSING job. Late or duplicate updates for a
    /// job in any other state are dropped and logged, never raised.
    pub async fn advance(&self, job_ref: &JobRef, progress: u8, message: &str) {
        match self.store.record_progress(job_ref, progress, Some(message)).await {
            Ok(Some(job)) => {
                self.publish(ProgressEvent::new(
                    job.task_id,
                    JobStatus::Processing,
                    job.progress,
                    message,
                ))
                .await;
            }
            Ok(None) => {
                debug!(task_id = %job_ref.task_id, progress, "Ignoring progress for job not in PROCESSING");
            }
            Err(e) => {
                warn!(task_id = %job_ref.task_id, "Failed to record progress: {}", e);
            }
        }
    }

    async fn completed(&self, job: GenerationJob) -> GenerationJob {
        metrics::record_job_completed(job.kind.as_str());
        info!(task_id = %job.task_id, kind = job.kind.as_str(), "Job completed");
        self.publish(ProgressEvent::completed(
            job.task_id.clone(),
            job.raw_results.clone().unwrap_or(Value::Null),
        ))
        .await;
        job
    }

    /// PROCESSING -> COMPLETED for jobs without a parent aggregate.
    pub async fn complete(&self, job_ref: &JobRef, results: &Value) -> JobResult<GenerationJob> {
        let job = self.store.mark_completed(job_ref, results).await?;
        Ok(self.completed(job).await)
    }

    /// Script job COMPLETED and project SCRIPT_READY together.
    pub async fn complete_script(
        &self,
        job_ref: &JobRef,
        project_id: &ProjectId,
        bundle: &ScriptBundle,
        results: &Value,
    ) -> JobResult<GenerationJob> {
        let job = self
            .store
            .store_script(job_ref, project_id, bundle, results)
            .await?;
        Ok(self.completed(job).await)
    }

    /// Render job COMPLETED, new video row and project COMPLETED together.
    pub async fn complete_render(
        &self,
        job_ref: &JobRef,
        video: &Video,
        results: &Value,
    ) -> JobResult<GenerationJob> {
        let job = self.store.complete_render(job_ref, video, results).await?;
        Ok(self.completed(job).await)
    }

    /// Audio job COMPLETED, track COMPLETED and video updated together.
    pub async fn complete_audio(
        &self,
        job_ref: &JobRef,
        track: &VideoAudioTrack,
        audio_url: &str,
        video_url: &str,
        results: &Value,
    ) -> JobResult<GenerationJob> {
        let job = self
            .store
            .complete_audio_regeneration(job_ref, track, audio_url, video_url, results)
            .await?;
        Ok(self.completed(job).await)
    }

    /// Any non-terminal state -> FAILED. The owning project or audio track
    /// fails in the same transaction with the same error text.
    pub async fn fail(&self, job_ref: &JobRef, error: &str) -> JobResult<GenerationJob> {
        let current = self.store.get_job(job_ref).await?;
        let job = match (current.kind, &current.project_id, current.audio_track_id()) {
            (JobKind::VideoScript | JobKind::VideoRender, Some(project_id), _) => {
                self.store
                    .fail_with_project(job_ref, project_id, error)
                    .await?
            }
            (JobKind::AudioRegeneration, _, Some(track_id)) => {
                self.store
                    .fail_audio_regeneration(job_ref, &track_id, error)
                    .await?
            }
            _ => self.store.mark_failed(job_ref, error).await?,
        };

        metrics::record_job_failed(job.kind.as_str());
        if error.starts_with(TIMEOUT_PREFIX) {
            metrics::record_job_timed_out(job.kind.as_str());
        }
        warn!(
            task_id = %job.task_id,
            kind = job.kind.as_str(),
            error = %error,
            "Job failed"
        );
        self.publish(ProgressEvent::failed(job.task_id.clone(), job.progress, error))
            .await;
        Ok(job)
    }

    /// Reset a job to PENDING and enqueue it again.
    ///
    /// Requires FAILED unless `force`. The owning project or audio track is
    /// stepped back in the same store transaction, so a failed reset leaves
    /// the job untouched.
    pub async fn retry(&self, job_ref: &JobRef, force: bool) -> JobResult<RetryOutcome> {
        let (old_status, job) = self.store.reset_for_retry(job_ref, force).await?;

        metrics::record_job_retried(job.kind.as_str());
        info!(
            task_id = %job.task_id,
            old_status = %old_status,
            retry_count = job.retry_count,
            force,
            "Job reset for retry"
        );
        self.enqueue(&job).await?;

        Ok(RetryOutcome {
            success: true,
            old_status,
            new_status: job.status,
            message: format!("Job reset from {} and re-enqueued", old_status),
        })
    }
}
