//! Render stage: a scripted project to a video artifact.

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use cgen_models::{GenerationJob, ProjectStatus, Video, VideoId};
use cgen_providers::{ProviderError, RenderRequest, RenderStatus};

use super::Orchestrator;
use crate::error::StageError;

impl Orchestrator {
    pub(super) async fn run_render(
        &self,
        job: GenerationJob,
        shutdown: &CancellationToken,
    ) -> Result<(), StageError> {
        let project_id = job
            .project_id
            .clone()
            .ok_or_else(|| StageError::precondition("render job has no project"))?;
        let store = self.lifecycle.store();
        let project = store.get_project(&job.workspace_id, &project_id).await?;
        if !project.has_script() {
            return Err(StageError::precondition(format!(
                "project {} has no script; run the script stage first",
                project_id
            )));
        }

        let request = RenderRequest::from_project(&job, &project)?;
        let provider = self
            .collaborators
            .providers
            .resolve_or_default(job.generation_config.get("provider").and_then(Value::as_str));
        store
            .set_project_status(&job.workspace_id, &project_id, ProjectStatus::Processing)
            .await?;

        let progress = self.progress(&job).within(5, 95);
        progress.step(0, "render submitted").await;

        let render_provider = provider.clone();
        let result = self
            .guarded("render", shutdown, move |token| {
                let provider = render_provider.clone();
                let request = request.clone();
                let progress = progress.clone();
                async move {
                    provider
                        .render(&request, &progress, token)
                        .await
                        .map_err(StageError::from)
                }
            })
            .await?;

        if result.status == RenderStatus::Failed {
            return Err(ProviderError::RenderFailed(result.extra.to_string()).into());
        }
        let video_url = result
            .primary_url()
            .ok_or_else(|| ProviderError::invalid_response("render produced no artifact"))?
            .to_string();

        let now = Utc::now();
        let video = Video {
            id: VideoId::new(),
            workspace_id: job.workspace_id.clone(),
            project_id: project_id.clone(),
            render_task_id: Some(job.task_id.clone()),
            video_url: Some(video_url),
            provider: provider.name().to_string(),
            duration: project
                .script
                .as_ref()
                .map(|segments| segments.iter().map(|s| s.duration).sum::<f64>()),
            current_audio_track_id: None,
            created_at: now,
            updated_at: now,
        };
        let results = json!({
            "provider": provider.name(),
            "video_id": video.id,
            "artifact_urls": result.artifact_urls,
            "extra": result.extra,
        });
        self.lifecycle
            .complete_render(&job.job_ref(), &video, &results)
            .await?;
        Ok(())
    }
}
