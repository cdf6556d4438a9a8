//! Rendered videos and audio track history.

use serde_json::Value;
use sqlx::SqliteConnection;

use cgen_models::{
    AudioTrackId, AudioTrackStatus, GenerationJob, JobRef, NewJob, Video, VideoAudioTrack,
    VideoId, WorkspaceId,
};

use crate::error::{StoreError, StoreResult};
use crate::jobs::{complete_job_row, fail_job_row, insert_job_row};
use crate::pool::Store;
use crate::rows::{self, AudioTrackRow, VideoRow};

pub(crate) async fn insert_video_row(conn: &mut SqliteConnection, video: &Video) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO videos (id, workspace_id, project_id, render_task_id, video_url, provider, \
         duration, current_audio_track_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(video.id.as_str())
    .bind(video.workspace_id.as_str())
    .bind(video.project_id.as_str())
    .bind(video.render_task_id.as_ref().map(|t| t.as_str().to_string()))
    .bind(video.video_url.as_deref())
    .bind(&video.provider)
    .bind(video.duration)
    .bind(video.current_audio_track_id.as_ref().map(|t| t.as_str().to_string()))
    .bind(rows::format_ts(video.created_at))
    .bind(rows::format_ts(video.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_audio_track_row(
    conn: &mut SqliteConnection,
    track: &VideoAudioTrack,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO video_audio_tracks (id, workspace_id, video_id, voice, speed, volume, \
         status, audio_url, error_message, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(track.id.as_str())
    .bind(track.workspace_id.as_str())
    .bind(track.video_id.as_str())
    .bind(&track.settings.voice)
    .bind(track.settings.speed)
    .bind(track.settings.volume)
    .bind(track.status.as_str())
    .bind(track.audio_url.as_deref())
    .bind(track.error_message.as_deref())
    .bind(rows::format_ts(track.created_at))
    .bind(rows::format_ts(track.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_track(
    conn: &mut SqliteConnection,
    workspace_id: &WorkspaceId,
    track_id: &AudioTrackId,
    status: AudioTrackStatus,
    audio_url: Option<&str>,
    error: Option<&str>,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE video_audio_tracks SET status = ?, audio_url = COALESCE(?, audio_url), \
         error_message = ?, updated_at = ? WHERE id = ? AND workspace_id = ?",
    )
    .bind(status.as_str())
    .bind(audio_url)
    .bind(error)
    .bind(rows::now())
    .bind(track_id.as_str())
    .bind(workspace_id.as_str())
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::not_found(format!("audio track {}", track_id)));
    }
    Ok(())
}

/// Put a track back to pending for a retried regeneration. A track that
/// already completed is left alone so the retried job finds it done.
pub(crate) async fn reopen_track(
    conn: &mut SqliteConnection,
    workspace_id: &WorkspaceId,
    track_id: &AudioTrackId,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE video_audio_tracks SET status = 'pending', error_message = NULL, updated_at = ? \
         WHERE id = ? AND workspace_id = ? AND status != 'completed'",
    )
    .bind(rows::now())
    .bind(track_id.as_str())
    .bind(workspace_id.as_str())
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() > 0 {
        return Ok(());
    }

    let exists = sqlx::query("SELECT 1 FROM video_audio_tracks WHERE id = ? AND workspace_id = ?")
        .bind(track_id.as_str())
        .bind(workspace_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    match exists {
        Some(_) => Ok(()),
        None => Err(StoreError::not_found(format!("audio track {}", track_id))),
    }
}

impl Store {
    pub async fn create_video(&self, video: &Video) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_video_row(&mut *conn, video).await
    }

    pub async fn get_video(
        &self,
        workspace_id: &WorkspaceId,
        video_id: &VideoId,
    ) -> StoreResult<Video> {
        sqlx::query_as::<_, VideoRow>("SELECT * FROM videos WHERE id = ? AND workspace_id = ?")
            .bind(video_id.as_str())
            .bind(workspace_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("video {}", video_id)))?
            .try_into()
    }

    pub async fn insert_audio_track(&self, track: &VideoAudioTrack) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_audio_track_row(&mut *conn, track).await
    }

    /// Insert the track and its regeneration job in one transaction.
    pub async fn create_audio_job(
        &self,
        track: &VideoAudioTrack,
        job: &NewJob,
    ) -> StoreResult<GenerationJob> {
        let mut tx = self.pool.begin().await?;
        insert_audio_track_row(&mut *tx, track).await?;
        let job = insert_job_row(&mut *tx, job).await?;
        tx.commit().await?;
        Ok(job)
    }

    pub async fn get_audio_track(
        &self,
        workspace_id: &WorkspaceId,
        track_id: &AudioTrackId,
    ) -> StoreResult<VideoAudioTrack> {
        sqlx::query_as::<_, AudioTrackRow>(
            "SELECT * FROM video_audio_tracks WHERE id = ? AND workspace_id = ?",
        )
        .bind(track_id.as_str())
        .bind(workspace_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("audio track {}", track_id)))?
        .try_into()
    }

    /// Track history of a video, newest first.
    pub async fn list_audio_tracks(
        &self,
        workspace_id: &WorkspaceId,
        video_id: &VideoId,
    ) -> StoreResult<Vec<VideoAudioTrack>> {
        sqlx::query_as::<_, AudioTrackRow>(
            "SELECT * FROM video_audio_tracks WHERE video_id = ? AND workspace_id = ? \
             ORDER BY created_at DESC",
        )
        .bind(video_id.as_str())
        .bind(workspace_id.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(VideoAudioTrack::try_from)
        .collect()
    }

    pub async fn mark_audio_track_processing(
        &self,
        workspace_id: &WorkspaceId,
        track_id: &AudioTrackId,
    ) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        update_track(
            &mut *conn,
            workspace_id,
            track_id,
            AudioTrackStatus::Processing,
            None,
            None,
        )
        .await
    }

    /// Job COMPLETED, track COMPLETED, video pointing at the remuxed file
    /// and its new current track. All or nothing.
    pub async fn complete_audio_regeneration(
        &self,
        job_ref: &JobRef,
        track: &VideoAudioTrack,
        audio_url: &str,
        video_url: &str,
        results: &Value,
    ) -> StoreResult<GenerationJob> {
        let mut tx = self.pool.begin().await?;
        let job = complete_job_row(&mut *tx, job_ref, results).await?;
        update_track(
            &mut *tx,
            &job_ref.workspace_id,
            &track.id,
            AudioTrackStatus::Completed,
            Some(audio_url),
            None,
        )
        .await?;
        let updated = sqlx::query(
            "UPDATE videos SET video_url = ?, current_audio_track_id = ?, updated_at = ? \
             WHERE id = ? AND workspace_id = ?",
        )
        .bind(video_url)
        .bind(track.id.as_str())
        .bind(rows::now())
        .bind(track.video_id.as_str())
        .bind(job_ref.workspace_id.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("video {}", track.video_id)));
        }
        tx.commit().await?;
        Ok(job)
    }

    /// Job FAILED and track FAILED with the same error text.
    pub async fn fail_audio_regeneration(
        &self,
        job_ref: &JobRef,
        track_id: &AudioTrackId,
        error: &str,
    ) -> StoreResult<GenerationJob> {
        let mut tx = self.pool.begin().await?;
        let job = fail_job_row(&mut *tx, job_ref, error).await?;
        update_track(
            &mut *tx,
            &job_ref.workspace_id,
            track_id,
            AudioTrackStatus::Failed,
            None,
            Some(error),
        )
        .await?;
        tx.commit().await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cgen_models::{
        AudioSettings, JobKind, JobStatus, ProductContext, UserId, VideoProject,
    };
    use serde_json::json;

    async fn seed_video(store: &Store, url: Option<&str>) -> Video {
        let project = VideoProject::new(
            WorkspaceId::from("ws_a"),
            UserId::from("u1"),
            ProductContext {
                name: "Mug".into(),
                description: String::new(),
                features: vec![],
                target_audience: None,
            },
            20,
        );
        let job = NewJob::new(
            project.workspace_id.clone(),
            project.user_id.clone(),
            JobKind::VideoScript,
            json!({}),
        );
        store.create_project_with_job(&project, &job).await.unwrap();

        let now = Utc::now();
        let video = Video {
            id: VideoId::new(),
            workspace_id: project.workspace_id.clone(),
            project_id: project.id.clone(),
            render_task_id: None,
            video_url: url.map(str::to_string),
            provider: "mock".into(),
            duration: Some(20.0),
            current_audio_track_id: None,
            created_at: now,
            updated_at: now,
        };
        store.create_video(&video).await.unwrap();
        video
    }

    fn track_for(video: &Video) -> VideoAudioTrack {
        let now = Utc::now();
        VideoAudioTrack {
            id: AudioTrackId::new(),
            workspace_id: video.workspace_id.clone(),
            video_id: video.id.clone(),
            settings: AudioSettings {
                voice: "nova".into(),
                speed: 1.1,
                volume: 0.8,
            },
            status: AudioTrackStatus::Pending,
            audio_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn audio_job(video: &Video, track: &VideoAudioTrack) -> NewJob {
        NewJob::new(
            video.workspace_id.clone(),
            UserId::from("u1"),
            JobKind::AudioRegeneration,
            json!({"audio_track_id": track.id}),
        )
        .with_video(video.id.clone())
    }

    #[tokio::test]
    async fn test_audio_regeneration_commit() {
        let store = Store::in_memory().await.unwrap();
        let video = seed_video(&store, Some("https://cdn/v1.mp4")).await;
        let track = track_for(&video);
        let job = store.create_audio_job(&track, &audio_job(&video, &track)).await.unwrap();
        store.mark_started(&job.job_ref()).await.unwrap();
        store
            .mark_audio_track_processing(&video.workspace_id, &track.id)
            .await
            .unwrap();

        let done = store
            .complete_audio_regeneration(
                &job.job_ref(),
                &track,
                "https://cdn/a.mp3",
                "https://cdn/v2.mp4",
                &json!({}),
            )
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let video = store.get_video(&video.workspace_id, &video.id).await.unwrap();
        assert_eq!(video.video_url.as_deref(), Some("https://cdn/v2.mp4"));
        assert_eq!(video.current_audio_track_id, Some(track.id.clone()));

        let track = store.get_audio_track(&video.workspace_id, &track.id).await.unwrap();
        assert_eq!(track.status, AudioTrackStatus::Completed);
        assert_eq!(track.settings.speed, 1.1);
    }

    #[tokio::test]
    async fn test_audio_regeneration_failure_marks_track() {
        let store = Store::in_memory().await.unwrap();
        let video = seed_video(&store, None).await;
        let track = track_for(&video);
        let job = store.create_audio_job(&track, &audio_job(&video, &track)).await.unwrap();

        store
            .fail_audio_regeneration(&job.job_ref(), &track.id, "no rendered video")
            .await
            .unwrap();

        let track = store.get_audio_track(&video.workspace_id, &track.id).await.unwrap();
        assert_eq!(track.status, AudioTrackStatus::Failed);
        assert_eq!(track.error_message.as_deref(), Some("no rendered video"));
        let video = store.get_video(&video.workspace_id, &video.id).await.unwrap();
        assert!(!video.has_artifact());
    }

    #[tokio::test]
    async fn test_retry_reopens_failed_track_only() {
        let store = Store::in_memory().await.unwrap();
        let video = seed_video(&store, Some("https://cdn/v1.mp4")).await;

        let failed = track_for(&video);
        let job = store.create_audio_job(&failed, &audio_job(&video, &failed)).await.unwrap();
        store
            .fail_audio_regeneration(&job.job_ref(), &failed.id, "remux failed: exit 1")
            .await
            .unwrap();
        store.reset_for_retry(&job.job_ref(), false).await.unwrap();
        let reopened = store.get_audio_track(&video.workspace_id, &failed.id).await.unwrap();
        assert_eq!(reopened.status, AudioTrackStatus::Pending);
        assert_eq!(reopened.error_message, None);

        let done = track_for(&video);
        let job = store.create_audio_job(&done, &audio_job(&video, &done)).await.unwrap();
        store.mark_started(&job.job_ref()).await.unwrap();
        store
            .complete_audio_regeneration(
                &job.job_ref(),
                &done,
                "https://cdn/a.wav",
                "https://cdn/v2.mp4",
                &json!({}),
            )
            .await
            .unwrap();
        store.reset_for_retry(&job.job_ref(), true).await.unwrap();
        let kept = store.get_audio_track(&video.workspace_id, &done.id).await.unwrap();
        assert_eq!(kept.status, AudioTrackStatus::Completed);
    }

    #[tokio::test]
    async fn test_track_history() {
        let store = Store::in_memory().await.unwrap();
        let video = seed_video(&store, Some("https://cdn/v1.mp4")).await;
        store.insert_audio_track(&track_for(&video)).await.unwrap();
        store.insert_audio_track(&track_for(&video)).await.unwrap();

        let tracks = store.list_audio_tracks(&video.workspace_id, &video.id).await.unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(store
            .list_audio_tracks(&WorkspaceId::from("ws_b"), &video.id)
            .await
            .unwrap()
            .is_empty());
    }
}
