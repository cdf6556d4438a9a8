//! Copy and image job creation, job polling and the SSE progress stream.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;
use validator::Validate;

use cgen_models::{GenerationJob, JobKind, JobStatus, JobTable, NewJob, TaskId};

use super::job_ref;
use crate::context::WorkspaceContext;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use crate::stream::{self, DEFAULT_POLL_INTERVAL};

/// Returned by every job-creating endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobAccepted {
    pub task_id: TaskId,
    pub status: JobStatus,
}

impl From<&GenerationJob> for JobAccepted {
    fn from(job: &GenerationJob) -> Self {
        Self {
            task_id: job.task_id.clone(),
            status: job.status,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateCopyJobRequest {
    #[validate(length(min = 1, max = 200))]
    pub product_name: String,
    #[serde(default)]
    #[validate(length(max = 4000))]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 50))]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 50))]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, max = 10))]
    pub variants: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct CreateImageJobRequest {
    #[validate(length(min = 1, max = 2000))]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 64, max = 4096))]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 64, max = 4096))]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, max = 4))]
    pub count: Option<u32>,
}

async fn create_job<T: Serialize>(
    state: &AppState,
    ctx: WorkspaceContext,
    kind: JobKind,
    params: &T,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let config = serde_json::to_value(params).map_err(|e| ApiError::internal(e.to_string()))?;
    let job = NewJob::new(ctx.workspace_id, ctx.user_id, kind, config);
    let job = state.lifecycle.create(&job).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

/// POST /api/copy/jobs
pub async fn create_copy_job(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Json(request): Json<CreateCopyJobRequest>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    request.validate()?;
    create_job(&state, ctx, JobKind::Copy, &request).await
}

/// POST /api/image/jobs
pub async fn create_image_job(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Json(request): Json<CreateImageJobRequest>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    request.validate()?;
    create_job(&state, ctx, JobKind::Image, &request).await
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<GenerationJob>,
}

/// GET /api/jobs/:task_type
pub async fn list_jobs(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path(task_type): Path<String>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let table: JobTable = task_type.parse()?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let jobs = state
        .store()
        .list_jobs(&ctx.workspace_id, table, status, limit)
        .await?;
    Ok(Json(JobListResponse { jobs }))
}

/// GET /api/jobs/:task_type/:task_id
pub async fn get_job(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path((task_type, task_id)): Path<(String, String)>,
) -> ApiResult<Json<GenerationJob>> {
    let job_ref = job_ref(&ctx, &task_type, &task_id)?;
    Ok(Json(state.lifecycle.get(&job_ref).await?))
}

/// GET /api/jobs/:task_type/:task_id/events
///
/// Server-sent events: `snapshot`, then `progress` events, then `closed`.
pub async fn job_events(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path((task_type, task_id)): Path<(String, String)>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let job_ref = job_ref(&ctx, &task_type, &task_id)?;
    let frames = stream::open(state.lifecycle.clone(), job_ref, DEFAULT_POLL_INTERVAL).await?;

    metrics::record_stream_opened("sse");
    let guard = StreamGuard("sse");

    let events = frames.filter_map(move |frame| {
        let _guard = &guard;
        let event = Event::default()
            .event(frame.event_name())
            .json_data(frame.data());
        async move {
            match event {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    warn!("Dropping unserializable stream frame: {}", e);
                    None
                }
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Decrements the active stream gauge when the response body is dropped.
pub(crate) struct StreamGuard(pub(crate) &'static str);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        metrics::record_stream_closed(self.0);
    }
}
