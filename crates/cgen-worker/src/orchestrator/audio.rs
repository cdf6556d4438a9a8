//! Audio regeneration stage: new narration muxed into an existing video.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cgen_media::AudioRemuxer;
use cgen_models::{AudioSettings, AudioTrackStatus, GenerationJob};
use cgen_providers::SpeechSynthesizer;
use cgen_storage::{audio_track_key, audio_variant_key, ArtifactStorage};

use super::{Orchestrator, StageProgress};
use crate::error::StageError;

/// Uploaded artifacts of one regeneration.
struct Regenerated {
    audio_url: String,
    video_url: String,
    audio_duration: f64,
}

/// Inputs of one regeneration attempt. Cloned per attempt so every retry
/// starts from a fresh temporary directory.
#[derive(Clone)]
struct AudioWork {
    speech: Arc<dyn SpeechSynthesizer>,
    remuxer: Arc<dyn AudioRemuxer>,
    storage: Arc<dyn ArtifactStorage>,
    progress: StageProgress,
    work_dir: PathBuf,
    source_url: String,
    narration: String,
    settings: AudioSettings,
    audio_key: String,
    video_key: String,
}

impl AudioWork {
    async fn run(self, cancel: CancellationToken) -> Result<Regenerated, StageError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        // Removed on drop, including when the attempt is aborted
        let dir = tempfile::Builder::new()
            .prefix("audio-")
            .tempdir_in(&self.work_dir)?;

        let source = dir.path().join("source.mp4");
        self.progress.step(10, "downloading video").await;
        self.storage.download_to(&self.source_url, &source).await?;

        self.progress.step(30, "synthesizing speech").await;
        let speech = self
            .speech
            .synthesize(
                &self.narration,
                &self.settings,
                &dir.path().join("voice.wav"),
                cancel.clone(),
            )
            .await?;

        let audio = if self.settings.adjusts_volume() {
            self.progress.step(50, "adjusting loudness").await;
            let adjusted = dir.path().join("voice_adjusted.wav");
            self.remuxer
                .adjust_loudness(
                    &speech.path,
                    &adjusted,
                    self.settings.volume as f32,
                    cancel.clone(),
                )
                .await?;
            adjusted
        } else {
            speech.path.clone()
        };

        self.progress.step(65, "remuxing audio").await;
        let output = dir.path().join("output.mp4");
        self.remuxer.remux(&source, &audio, &output, cancel).await?;

        self.progress.step(85, "uploading").await;
        let audio_url = self.upload(&audio, &self.audio_key, "audio/wav").await?;
        let video_url = self.upload(&output, &self.video_key, "video/mp4").await?;

        Ok(Regenerated {
            audio_url,
            video_url,
            audio_duration: speech.duration_secs,
        })
    }

    async fn upload(&self, path: &Path, key: &str, content_type: &str) -> Result<String, StageError> {
        Ok(self.storage.upload_file(path, key, content_type).await?)
    }
}

impl Orchestrator {
    pub(super) async fn run_audio(
        &self,
        job: GenerationJob,
        shutdown: &CancellationToken,
    ) -> Result<(), StageError> {
        let track_id = job
            .audio_track_id()
            .ok_or_else(|| StageError::precondition("audio job has no audio_track_id"))?;
        let video_id = job
            .video_id
            .clone()
            .ok_or_else(|| StageError::precondition("audio job has no video"))?;
        let store = self.lifecycle.store();

        let track = store.get_audio_track(&job.workspace_id, &track_id).await?;
        let video = store.get_video(&job.workspace_id, &video_id).await?;

        if track.status == AudioTrackStatus::Completed {
            info!(
                task_id = %job.task_id,
                audio_track_id = %track_id,
                "Audio track already regenerated, completing without work"
            );
            let results = json!({
                "audio_track_id": track_id,
                "audio_url": track.audio_url,
                "video_url": video.video_url,
                "skipped": true,
            });
            self.lifecycle.complete(&job.job_ref(), &results).await?;
            return Ok(());
        }

        // Checked before any external call
        let source_url = match video.video_url.as_deref() {
            Some(url) if video.has_artifact() => url.to_string(),
            _ => {
                return Err(StageError::precondition(format!(
                    "no rendered video for video {}; render it before regenerating audio",
                    video_id
                )))
            }
        };
        let project = store.get_project(&job.workspace_id, &video.project_id).await?;
        let narration = project
            .narration()
            .filter(|text| !text.is_empty())
            .ok_or_else(|| {
                StageError::precondition(format!("project {} has no script to narrate", project.id))
            })?;

        store
            .mark_audio_track_processing(&job.workspace_id, &track_id)
            .await?;

        let work = AudioWork {
            speech: self.collaborators.speech.clone(),
            remuxer: self.collaborators.remuxer.clone(),
            storage: self.collaborators.storage.clone(),
            progress: self.progress(&job),
            work_dir: self.work_dir.clone(),
            source_url,
            narration,
            settings: track.settings.clone(),
            audio_key: audio_track_key(
                job.workspace_id.as_str(),
                video_id.as_str(),
                track_id.as_str(),
            ),
            video_key: audio_variant_key(
                job.workspace_id.as_str(),
                video_id.as_str(),
                track_id.as_str(),
            ),
        };
        let regenerated = self
            .guarded("audio regeneration", shutdown, move |token| {
                work.clone().run(token)
            })
            .await?;

        let results = json!({
            "audio_track_id": track_id,
            "audio_url": regenerated.audio_url,
            "video_url": regenerated.video_url,
            "audio_duration": regenerated.audio_duration,
        });
        self.lifecycle
            .complete_audio(
                &job.job_ref(),
                &track,
                &regenerated.audio_url,
                &regenerated.video_url,
                &results,
            )
            .await?;
        Ok(())
    }
}

