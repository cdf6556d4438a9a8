//! End-to-end stage pipeline over the in-memory store, queue and bus.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cgen_jobs::JobLifecycle;
use cgen_media::{AudioRemuxer, MediaError, MediaResult};
use cgen_models::{
    AudioSettings, AudioTrackId, AudioTrackStatus, GenerationJob, JobKind, JobRef, JobStatus,
    NewJob, ProductContext, ProjectStatus, UserId, Video, VideoAudioTrack, VideoId, VideoProject,
    WorkspaceId,
};
use cgen_providers::{MockRenderProvider, ProviderRegistry};
use cgen_queue::{InMemoryProgressBus, InMemoryTaskQueue, TaskQueue};
use cgen_storage::{ArtifactStorage, LocalStorage, StorageResult};
use cgen_store::Store;
use cgen_worker::{
    Collaborators, JobExecutor, Orchestrator, RetryPolicy, StageOutcome, WorkerConfig,
};

/// Copies files instead of running FFmpeg.
struct CopyRemuxer;

#[async_trait]
impl AudioRemuxer for CopyRemuxer {
    async fn adjust_loudness(
        &self,
        input: &Path,
        output: &Path,
        _volume: f32,
        _cancel: CancellationToken,
    ) -> MediaResult<()> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn remux(
        &self,
        video: &Path,
        _audio: &Path,
        output: &Path,
        _cancel: CancellationToken,
    ) -> MediaResult<()> {
        tokio::fs::copy(video, output).await?;
        Ok(())
    }
}

/// Remux that always fails the way a corrupt source does.
struct BrokenRemuxer;

#[async_trait]
impl AudioRemuxer for BrokenRemuxer {
    async fn adjust_loudness(
        &self,
        input: &Path,
        output: &Path,
        _volume: f32,
        _cancel: CancellationToken,
    ) -> MediaResult<()> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn remux(
        &self,
        _video: &Path,
        _audio: &Path,
        _output: &Path,
        _cancel: CancellationToken,
    ) -> MediaResult<()> {
        Err(MediaError::ffmpeg_failed(
            "exit status 1",
            Some("source.mp4: Invalid data found when processing input".into()),
            Some(1),
        ))
    }
}

/// Local storage that counts calls.
struct CountingStorage {
    inner: LocalStorage,
    calls: AtomicUsize,
}

#[async_trait]
impl ArtifactStorage for CountingStorage {
    async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.upload_file(path, key, content_type).await
    }

    async fn download_to(&self, url: &str, dest: &Path) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.download_to(url, dest).await
    }
}

struct Harness {
    lifecycle: Arc<JobLifecycle>,
    queue: Arc<InMemoryTaskQueue>,
    orchestrator: Orchestrator,
    storage: Arc<CountingStorage>,
    config: WorkerConfig,
    dir: TempDir,
}

fn worker_config(dir: &TempDir, soft: Duration, hard: Duration) -> WorkerConfig {
    WorkerConfig {
        soft_timeout: soft,
        hard_timeout: hard,
        work_dir: dir.path().join("work"),
        consume_block: Duration::from_millis(20),
        claim_interval: Duration::from_secs(3600),
        shutdown_timeout: Duration::from_secs(2),
        retry: RetryPolicy::none(),
        ..WorkerConfig::default()
    }
}

async fn harness_with(render_step: Duration, soft: Duration, hard: Duration) -> Harness {
    build_harness(render_step, soft, hard, Arc::new(CopyRemuxer)).await
}

async fn build_harness(
    render_step: Duration,
    soft: Duration,
    hard: Duration,
    remuxer: Arc<dyn AudioRemuxer>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory().await.unwrap();
    let queue = Arc::new(InMemoryTaskQueue::new());
    let bus = Arc::new(InMemoryProgressBus::default());
    let lifecycle = Arc::new(JobLifecycle::new(store, queue.clone(), bus));

    let storage = Arc::new(CountingStorage {
        inner: LocalStorage::new(dir.path().join("artifacts")),
        calls: AtomicUsize::new(0),
    });
    let registry = ProviderRegistry::new("mock", Arc::new(MockRenderProvider::new(render_step)));
    let mut collaborators = Collaborators::mock(registry, storage.clone());
    collaborators.remuxer = remuxer;

    let config = worker_config(&dir, soft, hard);
    let orchestrator = Orchestrator::new(lifecycle.clone(), collaborators, &config);
    Harness {
        lifecycle,
        queue,
        orchestrator,
        storage,
        config,
        dir,
    }
}

async fn harness() -> Harness {
    harness_with(
        Duration::from_millis(5),
        Duration::from_secs(10),
        Duration::from_secs(12),
    )
    .await
}

fn ws() -> WorkspaceId {
    WorkspaceId::from("ws-1")
}

impl Harness {
    /// Run every ready task once, acking as the executor would.
    async fn drain(&self) -> Vec<StageOutcome> {
        let mut outcomes = Vec::new();
        let deliveries = self
            .queue
            .consume("test", Duration::from_millis(10), 10)
            .await
            .unwrap();
        for delivery in deliveries {
            let outcome = self
                .orchestrator
                .run_task(&delivery.task, &CancellationToken::new())
                .await
                .unwrap();
            self.queue.ack(&delivery).await.unwrap();
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn create_project(&self, target: u32) -> (VideoProject, GenerationJob) {
        let project = VideoProject::new(
            ws(),
            UserId::from("u-1"),
            ProductContext {
                name: "Aero".into(),
                description: "A travel bottle".into(),
                features: vec!["leak proof".into(), "featherweight".into()],
                target_audience: None,
            },
            target,
        );
        let job = NewJob::new(ws(), UserId::from("u-1"), JobKind::VideoScript, json!({}))
            .with_project(project.id.clone());
        let job = self.lifecycle.create_project(&project, &job).await.unwrap();
        (project, job)
    }

    async fn scripted_project(&self) -> VideoProject {
        let (project, _) = self.create_project(30).await;
        assert_eq!(self.drain().await, vec![StageOutcome::Completed]);
        self.lifecycle
            .store()
            .get_project(&ws(), &project.id)
            .await
            .unwrap()
    }

    async fn create_render(&self, project: &VideoProject) -> GenerationJob {
        let job = NewJob::new(
            ws(),
            UserId::from("u-1"),
            JobKind::VideoRender,
            json!({"provider": "mock"}),
        )
        .with_project(project.id.clone());
        self.lifecycle.create(&job).await.unwrap()
    }

    async fn insert_video(&self, project: &VideoProject, video_url: Option<String>) -> Video {
        let now = Utc::now();
        let video = Video {
            id: VideoId::new(),
            workspace_id: ws(),
            project_id: project.id.clone(),
            render_task_id: None,
            video_url,
            provider: "mock".into(),
            duration: Some(30.0),
            current_audio_track_id: None,
            created_at: now,
            updated_at: now,
        };
        self.lifecycle.store().create_video(&video).await.unwrap();
        video
    }

    async fn create_audio(&self, video: &Video, volume: f64) -> (VideoAudioTrack, GenerationJob) {
        let now = Utc::now();
        let track = VideoAudioTrack {
            id: AudioTrackId::new(),
            workspace_id: ws(),
            video_id: video.id.clone(),
            settings: AudioSettings {
                volume,
                ..AudioSettings::default()
            },
            status: AudioTrackStatus::Pending,
            audio_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let job = NewJob::new(
            ws(),
            UserId::from("u-1"),
            JobKind::AudioRegeneration,
            json!({"audio_track_id": track.id}),
        )
        .with_video(video.id.clone());
        let job = self.lifecycle.create_audio(&track, &job).await.unwrap();
        (track, job)
    }

    /// Video whose artifact is a local file the storage can download.
    async fn rendered_video(&self, project: &VideoProject) -> Video {
        let source = self.dir.path().join("rendered.mp4");
        tokio::fs::write(&source, b"not really a video").await.unwrap();
        self.insert_video(project, Some(format!("file://{}", source.display())))
            .await
    }

    async fn job(&self, job_ref: &JobRef) -> GenerationJob {
        self.lifecycle.get(job_ref).await.unwrap()
    }
}

#[tokio::test]
async fn test_script_stage_reconciles_to_target() {
    let h = harness().await;
    let (project, job) = h.create_project(30).await;

    assert_eq!(h.drain().await, vec![StageOutcome::Completed]);

    let job = h.job(&job.job_ref()).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);

    let project = h.lifecycle.store().get_project(&ws(), &project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::ScriptReady);
    let script = project.script.unwrap();
    let storyboard = project.storyboard.unwrap();
    assert!(script.len() >= 2);
    assert_eq!(script.len(), storyboard.len());

    let script_sum: f64 = script.iter().map(|s| s.duration).sum();
    let storyboard_sum: f64 = storyboard.iter().map(|s| s.duration).sum();
    assert!((script_sum - 30.0).abs() <= 2.0);
    assert!((script_sum - storyboard_sum).abs() < 1e-6);
}

#[tokio::test]
async fn test_render_stage_streams_monotonic_progress() {
    let h = harness().await;
    let project = h.scripted_project().await;
    let job = h.create_render(&project).await;
    let watch = h.lifecycle.watch(&job.job_ref()).await.unwrap();
    assert_eq!(watch.snapshot.status, JobStatus::Pending);

    assert_eq!(h.drain().await, vec![StageOutcome::Completed]);

    let events: Vec<_> = watch.events.collect().await;
    let progress: Vec<u8> = events.iter().map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    let last = events.last().unwrap();
    assert_eq!(last.status, JobStatus::Completed);
    assert_eq!(last.progress, 100);

    let job = h.job(&job.job_ref()).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    let results = job.raw_results.unwrap();
    assert_eq!(results["artifact_urls"].as_array().unwrap().len(), 1);

    let project = h.lifecycle.store().get_project(&ws(), &project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);

    let video_id = VideoId::from(results["video_id"].as_str().unwrap());
    let video = h.lifecycle.store().get_video(&ws(), &video_id).await.unwrap();
    assert!(video.has_artifact());
    assert_eq!(video.render_task_id, Some(job.task_id));
}

#[tokio::test]
async fn test_late_subscriber_gets_final_snapshot() {
    let h = harness().await;
    let project = h.scripted_project().await;
    let job = h.create_render(&project).await;
    h.drain().await;

    let watch = h.lifecycle.watch(&job.job_ref()).await.unwrap();
    assert_eq!(watch.snapshot.status, JobStatus::Completed);
    assert_eq!(watch.snapshot.progress, 100);
    assert!(watch.snapshot.raw_results.is_some());
}

#[tokio::test]
async fn test_render_without_script_fails_job_and_project() {
    let h = harness().await;
    let (project, script_job) = h.create_project(30).await;
    // Leave the script task unprocessed
    h.queue.consume("test", Duration::from_millis(10), 10).await.unwrap();

    let job = h.create_render(&project).await;
    let outcomes = h.drain().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(&outcomes[0], StageOutcome::Failed(e) if e.contains("has no script")));

    let project = h.lifecycle.store().get_project(&ws(), &project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(h.job(&job.job_ref()).await.status, JobStatus::Failed);
    assert_eq!(h.job(&script_job.job_ref()).await.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_audio_without_artifact_fails_before_external_calls() {
    let h = harness().await;
    let project = h.scripted_project().await;
    let video = h.insert_video(&project, None).await;
    let (track, job) = h.create_audio(&video, 1.0).await;

    let outcomes = h.drain().await;
    assert!(matches!(&outcomes[0], StageOutcome::Failed(e) if e.contains("no rendered video")));
    assert_eq!(h.storage.calls.load(Ordering::SeqCst), 0);

    let job = h.job(&job.job_ref()).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("no rendered video"));

    let track = h.lifecycle.store().get_audio_track(&ws(), &track.id).await.unwrap();
    assert_eq!(track.status, AudioTrackStatus::Failed);
}

#[tokio::test]
async fn test_audio_regeneration_replaces_video_audio() {
    let h = harness().await;
    let project = h.scripted_project().await;

    let source = h.dir.path().join("rendered.mp4");
    tokio::fs::write(&source, b"not really a video").await.unwrap();
    let video = h
        .insert_video(&project, Some(format!("file://{}", source.display())))
        .await;
    let (track, job) = h.create_audio(&video, 1.5).await;

    assert_eq!(h.drain().await, vec![StageOutcome::Completed]);

    let job = h.job(&job.job_ref()).await;
    assert_eq!(job.status, JobStatus::Completed);

    let track = h.lifecycle.store().get_audio_track(&ws(), &track.id).await.unwrap();
    assert_eq!(track.status, AudioTrackStatus::Completed);
    assert!(track.audio_url.unwrap().ends_with(".wav"));

    let video = h.lifecycle.store().get_video(&ws(), &video.id).await.unwrap();
    assert_eq!(video.current_audio_track_id, Some(track.id.clone()));
    let url = video.video_url.unwrap();
    assert!(url.ends_with(&format!("{}/{}.mp4", video.id, track.id)));
    assert!(Path::new(url.trim_start_matches("file://")).exists());

    // Per-invocation scratch space is gone
    let mut work = tokio::fs::read_dir(&h.config.work_dir).await.unwrap();
    assert!(work.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn test_remux_failure_fails_job_and_track() {
    let h = build_harness(
        Duration::from_millis(5),
        Duration::from_secs(10),
        Duration::from_secs(12),
        Arc::new(BrokenRemuxer),
    )
    .await;
    let project = h.scripted_project().await;
    let video = h.rendered_video(&project).await;
    let (track, job) = h.create_audio(&video, 1.0).await;

    let outcomes = h.drain().await;
    assert!(matches!(&outcomes[0], StageOutcome::Failed(e) if e.starts_with("remux failed:")));

    let job = h.job(&job.job_ref()).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error_message.unwrap();
    assert!(error.starts_with("remux failed:"));
    assert!(error.contains("Invalid data found"));

    let track = h.lifecycle.store().get_audio_track(&ws(), &track.id).await.unwrap();
    assert_eq!(track.status, AudioTrackStatus::Failed);
    assert_eq!(track.error_message.as_deref(), Some(error.as_str()));

    // Downloaded the source, uploaded nothing
    assert_eq!(h.storage.calls.load(Ordering::SeqCst), 1);
    let video = h.lifecycle.store().get_video(&ws(), &video.id).await.unwrap();
    assert!(video.current_audio_track_id.is_none());

    let mut work = tokio::fs::read_dir(&h.config.work_dir).await.unwrap();
    assert!(work.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn test_regenerating_completed_track_does_no_work() {
    let h = harness().await;
    let project = h.scripted_project().await;
    let video = h.rendered_video(&project).await;
    let (track, job) = h.create_audio(&video, 1.0).await;
    let job_ref = job.job_ref();
    assert_eq!(h.drain().await, vec![StageOutcome::Completed]);

    let calls = h.storage.calls.load(Ordering::SeqCst);
    let regenerated = h.lifecycle.store().get_video(&ws(), &video.id).await.unwrap();

    h.lifecycle.retry(&job_ref, true).await.unwrap();
    let kept = h.lifecycle.store().get_audio_track(&ws(), &track.id).await.unwrap();
    assert_eq!(kept.status, AudioTrackStatus::Completed);

    assert_eq!(h.drain().await, vec![StageOutcome::Completed]);

    let job = h.job(&job_ref).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    let results = job.raw_results.unwrap();
    assert_eq!(results["skipped"], json!(true));
    assert_eq!(results["audio_url"], json!(kept.audio_url));

    assert_eq!(h.storage.calls.load(Ordering::SeqCst), calls);
    let video = h.lifecycle.store().get_video(&ws(), &video.id).await.unwrap();
    assert_eq!(video.video_url, regenerated.video_url);
    assert_eq!(video.current_audio_track_id, Some(track.id));
}

#[tokio::test]
async fn test_retry_failed_job_then_reject_while_processing() {
    let h = harness().await;
    let project = h.scripted_project().await;
    let video = h.insert_video(&project, None).await;
    let (track, job) = h.create_audio(&video, 1.0).await;
    h.drain().await;
    let job_ref = job.job_ref();

    let outcome = h.lifecycle.retry(&job_ref, false).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.old_status, JobStatus::Failed);
    assert_eq!(outcome.new_status, JobStatus::Pending);

    let job = h.job(&job_ref).await;
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.progress, 0);
    assert!(job.error_message.is_none());
    let track = h.lifecycle.store().get_audio_track(&ws(), &track.id).await.unwrap();
    assert_eq!(track.status, AudioTrackStatus::Pending);
    assert_eq!(h.queue.ready_tasks()[0].retry_generation, 1);

    h.lifecycle.start(&job_ref).await.unwrap();
    let err = h.lifecycle.retry(&job_ref, false).await.unwrap_err();
    assert!(err.is_invalid_state());
}

#[tokio::test]
async fn test_superseded_delivery_is_skipped() {
    let h = harness().await;
    let project = h.scripted_project().await;
    let job = h.create_render(&project).await;
    let stale = h.queue.consume("test", Duration::from_millis(10), 1).await.unwrap();

    h.lifecycle.retry(&job.job_ref(), true).await.unwrap();

    let outcome = h
        .orchestrator
        .run_task(&stale[0].task, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, StageOutcome::Skipped("superseded by a retry"));
    assert_eq!(h.job(&job.job_ref()).await.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_stage_timeout_fails_job() {
    let h = harness_with(
        Duration::from_secs(30),
        Duration::from_millis(100),
        Duration::from_millis(300),
    )
    .await;
    let project = h.scripted_project().await;
    let job = h.create_render(&project).await;

    let outcomes = h.drain().await;
    assert!(matches!(&outcomes[0], StageOutcome::Failed(e) if e.starts_with("timeout: stage exceeded")));

    let job = h.job(&job.job_ref()).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().starts_with("timeout:"));
    let project = h.lifecycle.store().get_project(&ws(), &project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
}

#[tokio::test]
async fn test_copy_and_image_jobs() {
    let h = harness().await;
    let copy = h
        .lifecycle
        .create(&NewJob::new(
            ws(),
            UserId::from("u-1"),
            JobKind::Copy,
            json!({"product_name": "Aero", "variants": 2}),
        ))
        .await
        .unwrap();
    let image = h
        .lifecycle
        .create(&NewJob::new(
            ws(),
            UserId::from("u-1"),
            JobKind::Image,
            json!({"prompt": "bottle on a beach"}),
        ))
        .await
        .unwrap();
    let bad = h
        .lifecycle
        .create(&NewJob::new(ws(), UserId::from("u-1"), JobKind::Image, json!({})))
        .await
        .unwrap();

    h.drain().await;

    let copy = h.job(&copy.job_ref()).await;
    assert_eq!(copy.raw_results.unwrap()["variants"].as_array().unwrap().len(), 2);
    let image = h.job(&image.job_ref()).await;
    assert_eq!(image.raw_results.unwrap()["images"].as_array().unwrap().len(), 1);
    let bad = h.job(&bad.job_ref()).await;
    assert_eq!(bad.status, JobStatus::Failed);
    assert!(bad.error_message.unwrap().starts_with("invalid stage parameters"));
}

#[tokio::test]
async fn test_executor_runs_queued_jobs_and_stops() {
    let h = harness().await;
    let job = h
        .lifecycle
        .create(&NewJob::new(
            ws(),
            UserId::from("u-1"),
            JobKind::Copy,
            json!({"product_name": "Aero"}),
        ))
        .await
        .unwrap();

    let queue: Arc<dyn TaskQueue> = h.queue.clone();
    let executor = Arc::new(JobExecutor::new(
        h.config.clone(),
        queue,
        h.orchestrator.clone(),
        3,
    ));
    let runner = tokio::spawn({
        let executor = executor.clone();
        async move { executor.run().await }
    });

    let job_ref = job.job_ref();
    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.job(&job_ref).await.status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(completed.is_ok());

    executor.shutdown();
    runner.await.unwrap().unwrap();
    assert_eq!(h.queue.pending_count(), 0);
}
