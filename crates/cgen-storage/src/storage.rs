//! Artifact storage abstraction.

use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Stores rendered artifacts and fetches them back by URL.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Upload a local file under `key`, returning its public URL.
    async fn upload_file(&self, path: &Path, key: &str, content_type: &str)
        -> StorageResult<String>;

    /// Download the artifact at `url` into `dest`.
    async fn download_to(&self, url: &str, dest: &Path) -> StorageResult<()>;
}

/// Object key for the narration of one audio track.
pub fn audio_track_key(workspace_id: &str, video_id: &str, audio_track_id: &str) -> String {
    format!("{}/audio/{}/{}.wav", workspace_id, video_id, audio_track_id)
}

/// Object key for a regenerated video, unique per audio track.
pub fn audio_variant_key(workspace_id: &str, video_id: &str, audio_track_id: &str) -> String {
    format!("{}/videos/{}/{}.mp4", workspace_id, video_id, audio_track_id)
}

pub(crate) async fn ensure_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Fetch a URL not owned by any storage backend (e.g. a provider CDN).
pub(crate) async fn download_http(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> StorageResult<()> {
    use crate::error::StorageError;

    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| StorageError::download_failed(e.to_string()))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(StorageError::not_found(url));
    }
    if !status.is_success() {
        return Err(StorageError::download_failed(format!(
            "GET {} returned {}",
            url, status
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| StorageError::download_failed(e.to_string()))?;
    ensure_parent(dest).await?;
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
}
