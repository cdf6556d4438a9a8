//! Video project, render and audio regeneration endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use validator::Validate;

use cgen_models::{
    AudioSettings, AudioTrackId, AudioTrackStatus, JobKind, JobStatus, NewJob, ProductContext,
    ProjectId, TaskId, Video, VideoAudioTrack, VideoId, VideoProject,
};

use super::jobs::JobAccepted;
use crate::context::WorkspaceContext;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateProjectRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(default)]
    #[validate(length(max = 4000))]
    pub description: String,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub features: Vec<String>,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub target_audience: Option<String>,
    /// Seconds
    #[validate(range(min = 5, max = 180))]
    pub target_duration: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectAccepted {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub status: JobStatus,
}

/// POST /api/video/projects
///
/// Creates the project and its script job in one transaction.
pub async fn create_project(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<ProjectAccepted>)> {
    request.validate()?;

    let product = ProductContext {
        name: request.name,
        description: request.description,
        features: request.features,
        target_audience: request.target_audience,
    };
    let project = VideoProject::new(
        ctx.workspace_id.clone(),
        ctx.user_id.clone(),
        product,
        request.target_duration,
    );
    let job = NewJob::new(
        ctx.workspace_id,
        ctx.user_id,
        JobKind::VideoScript,
        json!({ "target_duration": request.target_duration }),
    )
    .with_project(project.id.clone());

    let job = state.lifecycle.create_project(&project, &job).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ProjectAccepted {
            project_id: project.id,
            task_id: job.task_id,
            status: job.status,
        }),
    ))
}

/// GET /api/video/projects/:project_id
pub async fn get_project(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path(project_id): Path<String>,
) -> ApiResult<Json<VideoProject>> {
    let project = state
        .store()
        .get_project(&ctx.workspace_id, &ProjectId::from(project_id))
        .await?;
    Ok(Json(project))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct RenderRequest {
    /// Render provider name; unknown names fall back to the default provider
    #[serde(default)]
    #[validate(length(min = 1, max = 50))]
    pub provider: Option<String>,
}

/// POST /api/video/projects/:project_id/render
pub async fn render_project(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path(project_id): Path<String>,
    request: Option<Json<RenderRequest>>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;

    let project = state
        .store()
        .get_project(&ctx.workspace_id, &ProjectId::from(project_id))
        .await?;
    if !project.has_script() {
        return Err(ApiError::conflict(format!(
            "project {} has no script yet (status {})",
            project.id, project.status
        )));
    }

    let job = NewJob::new(
        ctx.workspace_id,
        ctx.user_id,
        JobKind::VideoRender,
        json!({ "provider": request.provider }),
    )
    .with_project(project.id.clone());
    let job = state.lifecycle.create(&job).await?;

    info!(task_id = %job.task_id, project_id = %project.id, "Render requested");
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

/// GET /api/video/videos/:video_id
pub async fn get_video(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path(video_id): Path<String>,
) -> ApiResult<Json<Video>> {
    let video = state
        .store()
        .get_video(&ctx.workspace_id, &VideoId::from(video_id))
        .await?;
    Ok(Json(video))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegenerateAudioRequest {
    #[validate(length(min = 1, max = 50))]
    pub voice: String,
    #[serde(default)]
    #[validate(range(min = 0.5, max = 2.0))]
    pub speed: Option<f64>,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 2.0))]
    pub volume: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AudioAccepted {
    pub audio_track_id: AudioTrackId,
    pub task_id: TaskId,
    pub status: JobStatus,
}

/// POST /api/video/videos/:video_id/audio
///
/// The video need not have a rendered artifact yet; the worker fails the job
/// without side effects when it finds none.
pub async fn regenerate_audio(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path(video_id): Path<String>,
    Json(request): Json<RegenerateAudioRequest>,
) -> ApiResult<(StatusCode, Json<AudioAccepted>)> {
    request.validate()?;

    let video = state
        .store()
        .get_video(&ctx.workspace_id, &VideoId::from(video_id))
        .await?;

    let defaults = AudioSettings::default();
    let settings = AudioSettings {
        voice: request.voice,
        speed: request.speed.unwrap_or(defaults.speed),
        volume: request.volume.unwrap_or(defaults.volume),
    };
    let now = Utc::now();
    let track = VideoAudioTrack {
        id: AudioTrackId::new(),
        workspace_id: ctx.workspace_id.clone(),
        video_id: video.id.clone(),
        settings: settings.clone(),
        status: AudioTrackStatus::Pending,
        audio_url: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };

    let job = NewJob::new(
        ctx.workspace_id,
        ctx.user_id,
        JobKind::AudioRegeneration,
        json!({
            "audio_track_id": track.id,
            "voice": settings.voice,
            "speed": settings.speed,
            "volume": settings.volume,
        }),
    )
    .with_project(video.project_id.clone())
    .with_video(video.id.clone());

    let job = state.lifecycle.create_audio(&track, &job).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AudioAccepted {
            audio_track_id: track.id,
            task_id: job.task_id,
            status: job.status,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct AudioTrackListResponse {
    pub tracks: Vec<VideoAudioTrack>,
}

/// GET /api/video/videos/:video_id/audio
pub async fn list_audio_tracks(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path(video_id): Path<String>,
) -> ApiResult<Json<AudioTrackListResponse>> {
    let video_id = VideoId::from(video_id);
    // 404 for an unknown video rather than an empty history
    state.store().get_video(&ctx.workspace_id, &video_id).await?;
    let tracks = state
        .store()
        .list_audio_tracks(&ctx.workspace_id, &video_id)
        .await?;
    Ok(Json(AudioTrackListResponse { tracks }))
}
