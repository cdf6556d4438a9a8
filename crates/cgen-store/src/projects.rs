//! Video project aggregate and its multi-row commits.

use serde_json::Value;
use sqlx::SqliteConnection;

use cgen_models::{
    GenerationJob, JobRef, NewJob, ProjectId, ProjectStatus, ScriptBundle, Video, VideoProject,
    WorkspaceId,
};

use crate::error::{StoreError, StoreResult};
use crate::jobs::{complete_job_row, fail_job_row, insert_job_row};
use crate::pool::Store;
use crate::rows::{self, ProjectRow};
use crate::videos::insert_video_row;

pub(crate) async fn update_project_status(
    conn: &mut SqliteConnection,
    workspace_id: &WorkspaceId,
    project_id: &ProjectId,
    status: ProjectStatus,
    error: Option<&str>,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE video_projects SET status = ?, error_message = ?, updated_at = ? \
         WHERE id = ? AND workspace_id = ?",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(rows::now())
    .bind(project_id.as_str())
    .bind(workspace_id.as_str())
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::not_found(format!("project {}", project_id)));
    }
    Ok(())
}

impl Store {
    /// Insert the project and its first job in one transaction.
    pub async fn create_project_with_job(
        &self,
        project: &VideoProject,
        job: &NewJob,
    ) -> StoreResult<GenerationJob> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO video_projects (id, workspace_id, user_id, product, target_duration, \
             status, script, storyboard, error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?)",
        )
        .bind(project.id.as_str())
        .bind(project.workspace_id.as_str())
        .bind(project.user_id.as_str())
        .bind(serde_json::to_string(&project.product)?)
        .bind(project.target_duration as i64)
        .bind(project.status.as_str())
        .bind(rows::format_ts(project.created_at))
        .bind(rows::format_ts(project.updated_at))
        .execute(&mut *tx)
        .await?;

        let job = insert_job_row(&mut *tx, job).await?;
        tx.commit().await?;
        Ok(job)
    }

    pub async fn get_project(
        &self,
        workspace_id: &WorkspaceId,
        project_id: &ProjectId,
    ) -> StoreResult<VideoProject> {
        sqlx::query_as::<_, ProjectRow>(
            "SELECT * FROM video_projects WHERE id = ? AND workspace_id = ?",
        )
        .bind(project_id.as_str())
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("project {}", project_id)))?
        .try_into()
    }

    /// Set the project status, clearing any stored error.
    pub async fn set_project_status(
        &self,
        workspace_id: &WorkspaceId,
        project_id: &ProjectId,
        status: ProjectStatus,
    ) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        update_project_status(&mut *conn, workspace_id, project_id, status, None).await
    }

    /// Script job COMPLETED and project SCRIPT_READY, committed together.
    pub async fn store_script(
        &self,
        job_ref: &JobRef,
        project_id: &ProjectId,
        bundle: &ScriptBundle,
        results: &Value,
    ) -> StoreResult<GenerationJob> {
        let mut tx = self.pool.begin().await?;

        let job = complete_job_row(&mut *tx, job_ref, results).await?;
        let updated = sqlx::query(
            "UPDATE video_projects SET status = 'SCRIPT_READY', script = ?, storyboard = ?, \
             error_message = NULL, updated_at = ? WHERE id = ? AND workspace_id = ?",
        )
        .bind(serde_json::to_string(&bundle.script)?)
        .bind(serde_json::to_string(&bundle.storyboard)?)
        .bind(rows::now())
        .bind(project_id.as_str())
        .bind(job_ref.workspace_id.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("project {}", project_id)));
        }

        tx.commit().await?;
        Ok(job)
    }

    /// Job FAILED and project FAILED with the same error text.
    pub async fn fail_with_project(
        &self,
        job_ref: &JobRef,
        project_id: &ProjectId,
        error: &str,
    ) -> StoreResult<GenerationJob> {
        let mut tx = self.pool.begin().await?;
        let job = fail_job_row(&mut *tx, job_ref, error).await?;
        update_project_status(
            &mut *tx,
            &job_ref.workspace_id,
            project_id,
            ProjectStatus::Failed,
            Some(error),
        )
        .await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Render job COMPLETED, new video row, project COMPLETED. All or nothing.
    pub async fn complete_render(
        &self,
        job_ref: &JobRef,
        video: &Video,
        results: &Value,
    ) -> StoreResult<GenerationJob> {
        let mut tx = self.pool.begin().await?;
        let job = complete_job_row(&mut *tx, job_ref, results).await?;
        insert_video_row(&mut *tx, video).await?;
        update_project_status(
            &mut *tx,
            &job_ref.workspace_id,
            &video.project_id,
            ProjectStatus::Completed,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(job)
    }
}
