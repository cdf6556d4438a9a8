//! Cloudflare R2 storage client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::storage::{download_http, ensure_parent, ArtifactStorage};

/// Longest lifetime S3 presigning allows.
const MAX_PRESIGN: Duration = Duration::from_secs(7 * 24 * 3600);

/// Configuration for R2 client.
#[derive(Debug, Clone)]
pub struct R2Config {
    /// R2 endpoint URL (S3 API endpoint)
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    /// Region (usually "auto" for R2)
    pub region: String,
    /// Public bucket domain; objects are presigned when unset
    pub public_url: Option<String>,
}

impl R2Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("R2_ENDPOINT_URL")
                .map_err(|_| StorageError::config_error("R2_ENDPOINT_URL not set"))?,
            access_key_id: std::env::var("R2_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("R2_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("R2_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("R2_SECRET_ACCESS_KEY not set"))?,
            bucket_name: std::env::var("R2_BUCKET_NAME")
                .map_err(|_| StorageError::config_error("R2_BUCKET_NAME not set"))?,
            region: std::env::var("R2_REGION").unwrap_or_else(|_| "auto".to_string()),
            public_url: std::env::var("R2_PUBLIC_URL")
                .ok()
                .map(|u| u.trim_end_matches('/').to_string()),
        })
    }
}

/// Cloudflare R2 storage client.
#[derive(Clone)]
pub struct R2Client {
    client: Client,
    bucket: String,
    public_url: Option<String>,
    http: reqwest::Client,
}

impl R2Client {
    pub fn new(config: R2Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "r2",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket_name,
            public_url: config.public_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(R2Config::from_env()?))
    }

    /// Object key for a URL served from this bucket's public domain.
    pub fn key_for_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        let base = self.public_url.as_deref()?;
        url.strip_prefix(base)?.strip_prefix('/')
    }

    async fn object_url(&self, key: &str) -> StorageResult<String> {
        match &self.public_url {
            Some(base) => Ok(format!("{}/{}", base, key)),
            None => self.presign_get(key, MAX_PRESIGN).await,
        }
    }

    /// Generate a presigned URL for GET.
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let presign_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn download_key(&self, key: &str, dest: &Path) -> StorageResult<()> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    StorageError::not_found(key)
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
            .into_bytes();

        ensure_parent(dest).await?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStorage for R2Client {
    async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        content_type: &str,
    ) -> StorageResult<String> {
        debug!("Uploading {} to {}", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        info!("Uploaded {} to {}", path.display(), key);
        self.object_url(key).await
    }

    async fn download_to(&self, url: &str, dest: &Path) -> StorageResult<()> {
        debug!("Downloading {} to {}", url, dest.display());
        match self.key_for_url(url) {
            Some(key) => self.download_key(key, dest).await,
            None => download_http(&self.http, url, dest).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(public_url: Option<&str>) -> R2Client {
        R2Client::new(R2Config {
            endpoint_url: "https://account.r2.cloudflarestorage.com".into(),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
            bucket_name: "artifacts".into(),
            region: "auto".into(),
            public_url: public_url.map(String::from),
        })
    }

    #[test]
    fn test_key_for_public_url() {
        let r2 = client(Some("https://cdn.example.com"));
        assert_eq!(
            r2.key_for_url("https://cdn.example.com/ws/videos/v1/t1.mp4"),
            Some("ws/videos/v1/t1.mp4")
        );
        assert_eq!(r2.key_for_url("https://mock-cdn.local/videos/x.mp4"), None);
    }

    #[test]
    fn test_no_public_url_owns_nothing() {
        let r2 = client(None);
        assert_eq!(r2.key_for_url("https://cdn.example.com/a.mp4"), None);
    }
}
