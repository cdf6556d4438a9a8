//! Local filesystem storage for development and tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::storage::{download_http, ensure_parent, ArtifactStorage};

/// Stores artifacts under a root directory and addresses them as `file://` URLs.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    http: reqwest::Client,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }

    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        if key.split('/').any(|part| part == "..") {
            return Err(StorageError::UnsupportedUrl(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStorage for LocalStorage {
    async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        let target = self.resolve(key)?;
        ensure_parent(&target).await?;
        tokio::fs::copy(path, &target)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        debug!("Stored {} at {}", path.display(), target.display());
        Ok(self.url_for(key))
    }

    async fn download_to(&self, url: &str, dest: &Path) -> StorageResult<()> {
        if let Some(path) = url.strip_prefix("file://") {
            let source = Path::new(path);
            if !source.exists() {
                return Err(StorageError::not_found(url));
            }
            ensure_parent(dest).await?;
            tokio::fs::copy(source, dest).await?;
            return Ok(());
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return download_http(&self.http, url, dest).await;
        }
        Err(StorageError::UnsupportedUrl(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("bucket"));

        let src = dir.path().join("clip.mp4");
        tokio::fs::write(&src, b"video-bytes").await.unwrap();

        let url = storage
            .upload_file(&src, "ws/videos/v1/t1.mp4", "video/mp4")
            .await
            .unwrap();
        assert!(url.starts_with("file://"));

        let dest = dir.path().join("work/input.mp4");
        storage.download_to(&url, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"video-bytes");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let err = storage
            .download_to("file:///nope/missing.mp4", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let src = dir.path().join("a");
        tokio::fs::write(&src, b"x").await.unwrap();
        assert!(storage.upload_file(&src, "../escape", "x").await.is_err());
    }
}
