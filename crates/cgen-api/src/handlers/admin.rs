//! Operator endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use cgen_models::RetryOutcome;

use super::job_ref;
use crate::context::WorkspaceContext;
use crate::error::ApiResult;
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    /// Retry from any state, not only FAILED
    #[serde(default)]
    pub force: bool,
}

/// POST /api/admin/jobs/:task_type/:task_id/retry
///
/// Resets the job to PENDING, steps its project or audio track back, and
/// enqueues it again. 409 when the job is not FAILED and `force` is unset.
pub async fn retry_job(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    Path((task_type, task_id)): Path<(String, String)>,
    request: Option<Json<RetryRequest>>,
) -> ApiResult<Json<RetryOutcome>> {
    let force = request.map(|Json(r)| r.force).unwrap_or(false);
    let job_ref = job_ref(&ctx, &task_type, &task_id)?;

    info!(
        task_id = %job_ref.task_id,
        user_id = %ctx.user_id,
        force,
        "Operator retry requested"
    );
    let outcome = state.lifecycle.retry(&job_ref, force).await?;
    Ok(Json(outcome))
}

/// Queue status response.
#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    pub queue_length: u64,
    pub dlq_length: u64,
}

/// GET /api/admin/queue/status
pub async fn get_queue_status(
    State(state): State<AppState>,
    _ctx: WorkspaceContext,
) -> ApiResult<Json<QueueStatusResponse>> {
    let queue_length = state.queue().len().await?;
    let dlq_length = state.queue().dlq_len().await?;

    metrics::set_queue_length(queue_length);
    metrics::set_dlq_length(dlq_length);

    Ok(Json(QueueStatusResponse {
        queue_length,
        dlq_length,
    }))
}
