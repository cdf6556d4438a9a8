//! Generation job rows and their guarded transitions.
//!
//! Every transition is one `UPDATE ... WHERE status IN (...) RETURNING *`.
//! A miss is resolved into `NotFound` or `InvalidTransition` by re-reading
//! the row, so concurrent callers can never apply an illegal transition.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;

use cgen_models::{
    GenerationJob, JobKind, JobRef, JobStatus, JobTable, NewJob, ProjectStatus, WorkspaceId,
};

use crate::error::{StoreError, StoreResult};
use crate::pool::Store;
use crate::projects::update_project_status;
use crate::rows::{self, JobRow};
use crate::videos::reopen_track;

/// Highest progress a non-completed job may carry.
pub const MAX_PROCESSING_PROGRESS: u8 = 99;

pub(crate) async fn insert_job_row(
    conn: &mut SqliteConnection,
    job: &NewJob,
) -> StoreResult<GenerationJob> {
    let now = rows::now();
    let sql = format!(
        "INSERT INTO {} (task_id, workspace_id, user_id, kind, status, progress, \
         generation_config, project_id, video_id, retry_count, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?, ?, 0, ?, ?) RETURNING *",
        job.kind.table().table_name()
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job.task_id.as_str())
        .bind(job.workspace_id.as_str())
        .bind(job.user_id.as_str())
        .bind(job.kind.as_str())
        .bind(serde_json::to_string(&job.generation_config)?)
        .bind(job.project_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(job.video_id.as_ref().map(|v| v.as_str().to_string()))
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *conn)
        .await?;
    row.try_into()
}

pub(crate) async fn fetch_job_row(
    conn: &mut SqliteConnection,
    job_ref: &JobRef,
) -> StoreResult<Option<GenerationJob>> {
    let sql = format!(
        "SELECT * FROM {} WHERE task_id = ? AND workspace_id = ?",
        job_ref.table.table_name()
    );
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_ref.task_id.as_str())
        .bind(job_ref.workspace_id.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .map(GenerationJob::try_from)
        .transpose()
}

/// Explain why a guarded update matched no row.
async fn transition_miss(
    conn: &mut SqliteConnection,
    job_ref: &JobRef,
    to: JobStatus,
) -> StoreError {
    match fetch_job_row(conn, job_ref).await {
        Ok(Some(current)) => StoreError::InvalidTransition {
            task_id: job_ref.task_id.clone(),
            from: current.status,
            to,
        },
        Ok(None) => StoreError::not_found(format!("job {}", job_ref)),
        Err(e) => e,
    }
}

pub(crate) async fn complete_job_row(
    conn: &mut SqliteConnection,
    job_ref: &JobRef,
    results: &Value,
) -> StoreResult<GenerationJob> {
    let now = rows::now();
    let sql = format!(
        "UPDATE {} SET status = 'COMPLETED', progress = 100, raw_results = ?, \
         current_step = 'completed', error_message = NULL, completed_at = ?, updated_at = ? \
         WHERE task_id = ? AND workspace_id = ? AND status = 'PROCESSING' RETURNING *",
        job_ref.table.table_name()
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(serde_json::to_string(results)?)
        .bind(&now)
        .bind(&now)
        .bind(job_ref.task_id.as_str())
        .bind(job_ref.workspace_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => row.try_into(),
        None => Err(transition_miss(conn, job_ref, JobStatus::Completed).await),
    }
}

pub(crate) async fn fail_job_row(
    conn: &mut SqliteConnection,
    job_ref: &JobRef,
    error: &str,
) -> StoreResult<GenerationJob> {
    let now = rows::now();
    let sql = format!(
        "UPDATE {} SET status = 'FAILED', error_message = ?, completed_at = ?, updated_at = ? \
         WHERE task_id = ? AND workspace_id = ? AND status IN ('PENDING', 'PROCESSING') \
         RETURNING *",
        job_ref.table.table_name()
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(job_ref.task_id.as_str())
        .bind(job_ref.workspace_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => row.try_into(),
        None => Err(transition_miss(conn, job_ref, JobStatus::Failed).await),
    }
}

/// Step the project or audio track of a reset job back to the state its
/// stage expects.
async fn reset_owner(conn: &mut SqliteConnection, job: &GenerationJob) -> StoreResult<()> {
    match (job.kind, &job.project_id, job.audio_track_id()) {
        (JobKind::VideoScript, Some(project_id), _) => {
            update_project_status(conn, &job.workspace_id, project_id, ProjectStatus::Pending, None)
                .await
        }
        (JobKind::VideoRender, Some(project_id), _) => {
            update_project_status(
                conn,
                &job.workspace_id,
                project_id,
                ProjectStatus::ScriptReady,
                None,
            )
            .await
        }
        (JobKind::AudioRegeneration, _, Some(track_id)) => {
            reopen_track(conn, &job.workspace_id, &track_id).await
        }
        _ => Ok(()),
    }
}

impl Store {
    /// Insert a PENDING job.
    pub async fn insert_job(&self, job: &NewJob) -> StoreResult<GenerationJob> {
        let mut conn = self.pool.acquire().await?;
        insert_job_row(&mut *conn, job).await
    }

    pub async fn get_job(&self, job_ref: &JobRef) -> StoreResult<GenerationJob> {
        let mut conn = self.pool.acquire().await?;
        fetch_job_row(&mut *conn, job_ref)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("job {}", job_ref)))
    }

    /// Jobs of one workspace, newest first.
    pub async fn list_jobs(
        &self,
        workspace_id: &WorkspaceId,
        table: JobTable,
        status: Option<JobStatus>,
        limit: u32,
    ) -> StoreResult<Vec<GenerationJob>> {
        let sql = format!(
            "SELECT * FROM {} WHERE workspace_id = ? AND (? IS NULL OR status = ?) \
             ORDER BY created_at DESC LIMIT ?",
            table.table_name()
        );
        let status = status.map(|s| s.as_str());
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(workspace_id.as_str())
            .bind(status)
            .bind(status)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(GenerationJob::try_from)
            .collect()
    }

    /// PENDING -> PROCESSING. Idempotent when already PROCESSING;
    /// `started_at` is only set the first time.
    pub async fn mark_started(&self, job_ref: &JobRef) -> StoreResult<GenerationJob> {
        let mut conn = self.pool.acquire().await?;
        let now = rows::now();
        let sql = format!(
            "UPDATE {} SET status = 'PROCESSING', started_at = COALESCE(started_at, ?), \
             updated_at = ? WHERE task_id = ? AND workspace_id = ? \
             AND status IN ('PENDING', 'PROCESSING') RETURNING *",
            job_ref.table.table_name()
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&now)
            .bind(&now)
            .bind(job_ref.task_id.as_str())
            .bind(job_ref.workspace_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => row.try_into(),
            None => Err(transition_miss(&mut *conn, job_ref, JobStatus::Processing).await),
        }
    }

    /// Raise progress of a PROCESSING job. Never lowers the stored value and
    /// never reaches 100. Returns `None` when the job is not PROCESSING.
    pub async fn record_progress(
        &self,
        job_ref: &JobRef,
        progress: u8,
        message: Option<&str>,
    ) -> StoreResult<Option<GenerationJob>> {
        let now = rows::now();
        let sql = format!(
            "UPDATE {} SET progress = MAX(progress, ?), current_step = COALESCE(?, current_step), \
             updated_at = ? WHERE task_id = ? AND workspace_id = ? AND status = 'PROCESSING' \
             RETURNING *",
            job_ref.table.table_name()
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(progress.min(MAX_PROCESSING_PROGRESS) as i64)
            .bind(message)
            .bind(&now)
            .bind(job_ref.task_id.as_str())
            .bind(job_ref.workspace_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(GenerationJob::try_from)
            .transpose()
    }

    /// PROCESSING -> COMPLETED with `progress = 100`.
    pub async fn mark_completed(
        &self,
        job_ref: &JobRef,
        results: &Value,
    ) -> StoreResult<GenerationJob> {
        let mut conn = self.pool.acquire().await?;
        complete_job_row(&mut *conn, job_ref, results).await
    }

    /// Any non-terminal state -> FAILED.
    pub async fn mark_failed(&self, job_ref: &JobRef, error: &str) -> StoreResult<GenerationJob> {
        let mut conn = self.pool.acquire().await?;
        fail_job_row(&mut *conn, job_ref, error).await
    }

    /// Reset to PENDING for another attempt. Requires FAILED unless `force`.
    ///
    /// The owning aggregate steps back in the same transaction: a script
    /// retry puts the project back to PENDING, a render retry to
    /// SCRIPT_READY, an audio retry reopens the track. Returns the status the
    /// job had before the reset.
    pub async fn reset_for_retry(
        &self,
        job_ref: &JobRef,
        force: bool,
    ) -> StoreResult<(JobStatus, GenerationJob)> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_job_row(&mut *tx, job_ref)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("job {}", job_ref)))?;
        if !current.status.can_retry(force) {
            return Err(StoreError::InvalidTransition {
                task_id: job_ref.task_id.clone(),
                from: current.status,
                to: JobStatus::Pending,
            });
        }

        let now = rows::now();
        let sql = format!(
            "UPDATE {} SET status = 'PENDING', progress = 0, error_message = NULL, \
             current_step = NULL, raw_results = NULL, started_at = NULL, completed_at = NULL, \
             retry_count = retry_count + 1, updated_at = ? \
             WHERE task_id = ? AND workspace_id = ? AND status = ? RETURNING *",
            job_ref.table.table_name()
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&now)
            .bind(job_ref.task_id.as_str())
            .bind(job_ref.workspace_id.as_str())
            .bind(current.status.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let job = match row {
            Some(row) => GenerationJob::try_from(row)?,
            None => return Err(transition_miss(&mut *tx, job_ref, JobStatus::Pending).await),
        };
        reset_owner(&mut *tx, &job).await?;

        tx.commit().await?;
        Ok((current.status, job))
    }

    /// PROCESSING jobs in every table whose last update is older than
    /// `threshold`. Spans all workspaces; used only by the staleness sweep.
    pub async fn find_stale_processing(
        &self,
        threshold: Duration,
    ) -> StoreResult<Vec<GenerationJob>> {
        let age = TimeDelta::from_std(threshold)
            .map_err(|e| StoreError::corrupt(format!("invalid staleness threshold: {}", e)))?;
        let cutoff = rows::format_ts(Utc::now() - age);

        let mut stale = Vec::new();
        for table in JobTable::ALL {
            let sql = format!(
                "SELECT * FROM {} WHERE status = 'PROCESSING' AND updated_at < ? \
                 ORDER BY updated_at",
                table.table_name()
            );
            let rows = sqlx::query_as::<_, JobRow>(&sql)
                .bind(&cutoff)
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                stale.push(GenerationJob::try_from(row)?);
            }
        }
        Ok(stale)
    }
}
