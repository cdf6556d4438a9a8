//! Tenancy context extracted from request headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use cgen_models::{UserId, WorkspaceId};

use crate::error::ApiError;

pub const WORKSPACE_HEADER: &str = "X-Workspace-Id";
pub const USER_HEADER: &str = "X-User-Id";

/// Workspace and user a request acts for. Authentication happens upstream;
/// this only reads the identities the gateway forwarded.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for WorkspaceContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let workspace_id = header(parts, WORKSPACE_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {} header", WORKSPACE_HEADER)))?;
        let user_id = header(parts, USER_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {} header", USER_HEADER)))?;

        Ok(Self {
            workspace_id: WorkspaceId::from(workspace_id),
            user_id: UserId::from(user_id),
        })
    }
}
