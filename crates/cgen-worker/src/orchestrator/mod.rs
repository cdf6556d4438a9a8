//! Stage orchestrator.
//!
//! Turns one queued [`StageTask`] into a stage invocation: loads the job,
//! drops stale or superseded deliveries, moves the job to PROCESSING, runs
//! the stage under the deadline guard and retry policy, and commits the
//! outcome through [`JobLifecycle`].

mod audio;
mod content;
mod render;
mod script;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use cgen_jobs::JobLifecycle;
use cgen_media::{AudioRemuxer, FfmpegRemuxer};
use cgen_models::{GenerationJob, JobKind, JobRef};
use cgen_providers::{
    CopyWriter, ImageGenerator, MockCopyWriter, MockImageGenerator, MockScriptWriter,
    MockSpeechSynthesizer, ProviderRegistry, RenderProgress, ScriptWriter, SpeechSynthesizer,
};
use cgen_queue::{Stage, StageTask};
use cgen_storage::ArtifactStorage;

use crate::config::WorkerConfig;
use crate::deadline::DeadlineGuard;
use crate::error::{StageError, WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::retry::RetryPolicy;

/// External collaborators the stages call.
#[derive(Clone)]
pub struct Collaborators {
    pub providers: Arc<ProviderRegistry>,
    pub script_writer: Arc<dyn ScriptWriter>,
    pub copy_writer: Arc<dyn CopyWriter>,
    pub image_generator: Arc<dyn ImageGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub remuxer: Arc<dyn AudioRemuxer>,
    pub storage: Arc<dyn ArtifactStorage>,
}

impl Collaborators {
    /// Mock generators around the given render providers and storage.
    /// Remuxing still goes through FFmpeg.
    pub fn mock(providers: ProviderRegistry, storage: Arc<dyn ArtifactStorage>) -> Self {
        Self {
            providers: Arc::new(providers),
            script_writer: Arc::new(MockScriptWriter),
            copy_writer: Arc::new(MockCopyWriter),
            image_generator: Arc::new(MockImageGenerator::default()),
            speech: Arc::new(MockSpeechSynthesizer),
            remuxer: Arc::new(FfmpegRemuxer::default()),
            storage,
        }
    }
}

/// How a delivery was handled. Every variant means the delivery can be acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    /// The job was moved to FAILED with this error
    Failed(String),
    /// Nothing to do for this delivery
    Skipped(&'static str),
}

/// Maps stage-local progress into a band of the job's overall progress and
/// records it through the lifecycle.
#[derive(Clone)]
pub(crate) struct StageProgress {
    lifecycle: Arc<JobLifecycle>,
    job_ref: JobRef,
    floor: u8,
    ceiling: u8,
}

impl StageProgress {
    fn new(lifecycle: Arc<JobLifecycle>, job_ref: JobRef) -> Self {
        Self {
            lifecycle,
            job_ref,
            floor: 0,
            ceiling: 100,
        }
    }

    /// Same sink, reporting within `floor..=ceiling`.
    pub(crate) fn within(&self, floor: u8, ceiling: u8) -> Self {
        Self {
            floor: floor.min(ceiling),
            ceiling: ceiling.min(100),
            ..self.clone()
        }
    }

    fn scaled(&self, progress: u8) -> u8 {
        let span = (self.ceiling - self.floor) as u16;
        (self.floor as u16 + span * progress.min(100) as u16 / 100) as u8
    }

    pub(crate) async fn step(&self, progress: u8, message: &str) {
        self.lifecycle
            .advance(&self.job_ref, self.scaled(progress), message)
            .await;
    }
}

#[async_trait]
impl RenderProgress for StageProgress {
    async fn report(&self, progress: u8, message: &str) {
        self.step(progress, message).await;
    }
}

/// Runs stage tasks against the job state machine.
#[derive(Clone)]
pub struct Orchestrator {
    lifecycle: Arc<JobLifecycle>,
    collaborators: Collaborators,
    deadline: DeadlineGuard,
    retry: RetryPolicy,
    work_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        lifecycle: Arc<JobLifecycle>,
        collaborators: Collaborators,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            lifecycle,
            collaborators,
            deadline: config.deadline(),
            retry: config.retry.clone(),
            work_dir: config.work_dir.clone(),
        }
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    /// Handle one delivery.
    ///
    /// Stage failures are committed to the job and reported as
    /// [`StageOutcome::Failed`]. An `Err` means the outcome could not be
    /// recorded (store down, shutdown mid-stage) and the delivery should be
    /// redelivered.
    pub async fn run_task(
        &self,
        task: &StageTask,
        shutdown: &CancellationToken,
    ) -> WorkerResult<StageOutcome> {
        let logger = JobLogger::new(task);

        let job = match self.lifecycle.get(&task.job).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                logger.log_warning("job row not found, dropping task");
                return Ok(StageOutcome::Skipped("job not found"));
            }
            Err(e) => return Err(e.into()),
        };
        if job.is_terminal() {
            logger.log_warning(&format!("job already {}, dropping task", job.status));
            return Ok(StageOutcome::Skipped("job already terminal"));
        }
        if task.retry_generation < job.retry_count {
            logger.log_warning("task superseded by a retry, dropping");
            return Ok(StageOutcome::Skipped("superseded by a retry"));
        }

        let job = match self.lifecycle.start(&task.job).await {
            Ok(job) => job,
            Err(e) if e.is_invalid_state() => {
                return Ok(StageOutcome::Skipped("job left PENDING concurrently"));
            }
            Err(e) => return Err(e.into()),
        };
        logger.log_start(job.kind.as_str());

        let result = if Stage::for_kind(job.kind) != task.stage {
            Err(StageError::internal(format!(
                "{} task delivered for a {} job",
                task.stage,
                job.kind.as_str()
            )))
        } else {
            self.dispatch(job, shutdown)
                .instrument(logger.create_span())
                .await
        };

        match result {
            Ok(()) => {
                logger.log_completion("results committed");
                Ok(StageOutcome::Completed)
            }
            Err(e) if shutdown.is_cancelled() && !e.is_timeout() => {
                logger.log_warning(&format!("interrupted by shutdown: {}", e));
                Err(WorkerError::Interrupted(e.to_string()))
            }
            Err(e) => {
                let message = e.to_string();
                logger.log_error(&message);
                match self.lifecycle.fail(&task.job, &message).await {
                    Ok(_) => Ok(StageOutcome::Failed(message)),
                    Err(fail_err) if fail_err.is_invalid_state() => {
                        // Already terminal, e.g. swept while running
                        Ok(StageOutcome::Failed(message))
                    }
                    Err(fail_err) => Err(fail_err.into()),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        job: GenerationJob,
        shutdown: &CancellationToken,
    ) -> Result<(), StageError> {
        match job.kind {
            JobKind::VideoScript => self.run_script(job, shutdown).await,
            JobKind::VideoRender => self.run_render(job, shutdown).await,
            JobKind::AudioRegeneration => self.run_audio(job, shutdown).await,
            JobKind::Copy => self.run_copy(job, shutdown).await,
            JobKind::Image => self.run_image(job, shutdown).await,
        }
    }

    fn progress(&self, job: &GenerationJob) -> StageProgress {
        StageProgress::new(self.lifecycle.clone(), job.job_ref())
    }

    /// Run `attempt` under the retry policy, the whole sequence under the
    /// deadline guard. Each attempt gets the stage's cancellation token.
    async fn guarded<F, Fut, T>(
        &self,
        operation: &'static str,
        shutdown: &CancellationToken,
        attempt: F,
    ) -> Result<T, StageError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StageError>> + Send + 'static,
        T: Send + 'static,
    {
        let retry = self.retry.clone();
        self.deadline
            .run(shutdown, move |token| async move {
                retry.run(operation, || attempt(token.clone())).await
            })
            .await
    }
}
