//! HTTP handlers.

pub mod admin;
pub mod health;
pub mod jobs;
pub mod projects;

pub use health::{health, ready};

use std::str::FromStr;

use cgen_models::{JobRef, JobTable, TaskId};

use crate::context::WorkspaceContext;
use crate::error::{ApiError, ApiResult};

/// Resolve a `:task_type/:task_id` path pair inside the caller's workspace.
pub(crate) fn job_ref(ctx: &WorkspaceContext, task_type: &str, task_id: &str) -> ApiResult<JobRef> {
    let table = JobTable::from_str(task_type).map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(JobRef::new(
        table,
        ctx.workspace_id.clone(),
        TaskId::from(task_id),
    ))
}
