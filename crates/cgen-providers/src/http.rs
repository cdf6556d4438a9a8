//! HTTP-backed render providers.
//!
//! One implementation covers every external back-end: submit with
//! `POST {base}/renders`, then poll `GET {base}/renders/{id}` until the
//! response reports a terminal status. Back-ends differ only in
//! authentication and in where fields live in their JSON, which is
//! described by `AuthScheme` and `ResponseShape`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ProviderError, ProviderResult};
use crate::render::{RenderProgress, RenderProvider, RenderRequest, RenderResult};

/// How requests authenticate.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthScheme {
    Bearer(String),
    ApiKeyHeader { header: String, key: String },
    None,
}

impl AuthScheme {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            AuthScheme::Bearer(token) => request.bearer_auth(token),
            AuthScheme::ApiKeyHeader { header, key } => request.header(header.as_str(), key),
            AuthScheme::None => request,
        }
    }
}

/// JSON pointers locating fields in provider responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseShape {
    /// Render id in the submit response
    pub submit_id: String,
    pub status: String,
    pub progress: Option<String>,
    /// String or array of strings
    pub urls: String,
    pub error: Option<String>,
    pub completed_statuses: Vec<String>,
    pub failed_statuses: Vec<String>,
}

impl Default for ResponseShape {
    fn default() -> Self {
        Self {
            submit_id: "/id".to_string(),
            status: "/status".to_string(),
            progress: Some("/progress".to_string()),
            urls: "/artifact_urls".to_string(),
            error: Some("/error".to_string()),
            completed_statuses: vec!["completed".into(), "succeeded".into(), "done".into()],
            failed_statuses: vec!["failed".into(), "error".into()],
        }
    }
}

impl ResponseShape {
    fn string_at(&self, body: &Value, pointer: &str) -> Option<String> {
        body.pointer(pointer).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    fn urls_at(&self, body: &Value) -> Vec<String> {
        match body.pointer(&self.urls) {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn progress_at(&self, body: &Value) -> Option<u8> {
        let pointer = self.progress.as_deref()?;
        let value = body.pointer(pointer)?.as_f64()?;
        // Accept both 0..1 fractions and 0..100 percentages
        let percent = if value <= 1.0 { value * 100.0 } else { value };
        Some(percent.clamp(0.0, 100.0) as u8)
    }
}

/// Configuration of one HTTP back-end.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub name: String,
    pub base_url: String,
    pub auth: AuthScheme,
    pub shape: ResponseShape,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl HttpProviderConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, auth: AuthScheme) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            auth,
            shape: ResponseShape::default(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            max_polls: 120,
        }
    }

    /// Shotstack-style back-end: API key header, results under `/response`.
    pub fn shotstack(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            shape: ResponseShape {
                submit_id: "/response/id".into(),
                status: "/response/status".into(),
                progress: None,
                urls: "/response/url".into(),
                error: Some("/response/error".into()),
                completed_statuses: vec!["done".into()],
                failed_statuses: vec!["failed".into()],
            },
            ..Self::new(
                "shotstack",
                base_url,
                AuthScheme::ApiKeyHeader {
                    header: "x-api-key".into(),
                    key: api_key.into(),
                },
            )
        }
    }

    /// Creatomate-style back-end: bearer token, submit returns an array.
    pub fn creatomate(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            shape: ResponseShape {
                submit_id: "/0/id".into(),
                status: "/status".into(),
                progress: None,
                urls: "/url".into(),
                error: Some("/error_message".into()),
                completed_statuses: vec!["succeeded".into()],
                failed_statuses: vec!["failed".into()],
            },
            ..Self::new("creatomate", base_url, AuthScheme::Bearer(api_key.into()))
        }
    }
}

/// Render provider over an external HTTP API.
pub struct HttpRenderProvider {
    http: Client,
    base: Url,
    config: HttpProviderConfig,
}

impl HttpRenderProvider {
    pub fn new(config: HttpProviderConfig) -> ProviderResult<Self> {
        let mut base = Url::parse(&config.base_url).map_err(|e| {
            ProviderError::Config(format!("invalid base URL '{}': {}", config.base_url, e))
        })?;
        // Keep the last path segment when joining relative paths
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ProviderError::Network)?;

        Ok(Self { http, base, config })
    }

    fn endpoint(&self, path: &str) -> ProviderResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ProviderError::Config(format!("invalid endpoint '{}': {}", path, e)))
    }

    async fn read_json(response: Response) -> ProviderResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn submit(&self, request: &RenderRequest) -> ProviderResult<String> {
        let url = self.endpoint("renders")?;
        debug!(provider = %self.config.name, "Submitting render to {}", url);

        let response = self
            .config
            .auth
            .apply(self.http.post(url))
            .json(request)
            .send()
            .await?;
        let body = Self::read_json(response).await?;

        self.config
            .shape
            .string_at(&body, &self.config.shape.submit_id)
            .ok_or_else(|| {
                ProviderError::invalid_response(format!(
                    "no render id at '{}'",
                    self.config.shape.submit_id
                ))
            })
    }

    async fn poll(&self, render_id: &str) -> ProviderResult<Value> {
        let url = self.endpoint(&format!("renders/{}", render_id))?;
        let response = self.config.auth.apply(self.http.get(url)).send().await?;
        Self::read_json(response).await
    }
}

#[async_trait]
impl RenderProvider for HttpRenderProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn render(
        &self,
        request: &RenderRequest,
        progress: &dyn RenderProgress,
        cancel: CancellationToken,
    ) -> ProviderResult<RenderResult> {
        let render_id = self.submit(request).await?;
        info!(
            provider = %self.config.name,
            task_id = %request.task_id,
            render_id = %render_id,
            "Render submitted"
        );
        progress.report(10, "render submitted").await;

        let shape = &self.config.shape;
        for poll in 1..=self.config.max_polls {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let body = self.poll(&render_id).await?;
            let status = shape.string_at(&body, &shape.status).unwrap_or_default();

            if shape.completed_statuses.iter().any(|s| s.eq_ignore_ascii_case(&status)) {
                let urls = shape.urls_at(&body);
                if urls.is_empty() {
                    return Err(ProviderError::invalid_response(format!(
                        "render {} completed without artifact URL",
                        render_id
                    )));
                }
                progress.report(100, "render complete").await;
                return Ok(RenderResult::completed(
                    urls,
                    json!({ "provider": self.config.name, "render_id": render_id, "response": body }),
                ));
            }

            if shape.failed_statuses.iter().any(|s| s.eq_ignore_ascii_case(&status)) {
                let reason = shape
                    .error
                    .as_deref()
                    .and_then(|p| shape.string_at(&body, p))
                    .unwrap_or_else(|| format!("status '{}'", status));
                warn!(provider = %self.config.name, render_id = %render_id, "Render failed: {}", reason);
                return Err(ProviderError::RenderFailed(reason));
            }

            // Without a reported value, creep from 10 towards 90
            let value = shape
                .progress_at(&body)
                .unwrap_or_else(|| (10 + poll.min(16) * 5) as u8)
                .min(99);
            progress.report(value, &format!("rendering ({})", status)).await;
        }

        let waited = self.config.poll_interval.as_secs() * self.config.max_polls as u64;
        Err(ProviderError::Timeout(waited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderStatus;
    use crate::test_support::{render_request, RecordingProgress};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast(mut config: HttpProviderConfig) -> HttpProviderConfig {
        config.poll_interval = Duration::from_millis(5);
        config.max_polls = 5;
        config
    }

    #[tokio::test]
    async fn test_generic_provider_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/renders"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "r-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/renders/r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "progress": 1.0,
                "artifact_urls": ["https://cdn/x.mp4"]
            })))
            .mount(&server)
            .await;

        let provider = HttpRenderProvider::new(fast(HttpProviderConfig::new(
            "generic",
            format!("{}/v1", server.uri()),
            AuthScheme::Bearer("secret".into()),
        )))
        .unwrap();
        let progress = RecordingProgress::default();

        let result = provider
            .render(&render_request(), &progress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RenderStatus::Completed);
        assert_eq!(result.artifact_urls, vec!["https://cdn/x.mp4".to_string()]);
        assert_eq!(progress.values().last(), Some(&100));
    }

    #[tokio::test]
    async fn test_shotstack_shape_and_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/renders"))
            .and(header("x-api-key", "k"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"response": {"id": "abc"}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/renders/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {"status": "done", "url": "https://cdn/s.mp4"}
            })))
            .mount(&server)
            .await;

        let provider =
            HttpRenderProvider::new(fast(HttpProviderConfig::shotstack(server.uri(), "k"))).unwrap();
        let result = provider
            .render(&render_request(), &RecordingProgress::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.primary_url(), Some("https://cdn/s.mp4"));
    }

    #[tokio::test]
    async fn test_failed_status_maps_to_render_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/renders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "c1"}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/renders/c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "failed",
                "error_message": "template missing"
            })))
            .mount(&server)
            .await;

        let provider =
            HttpRenderProvider::new(fast(HttpProviderConfig::creatomate(server.uri(), "t"))).unwrap();
        let err = provider
            .render(&render_request(), &RecordingProgress::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RenderFailed(ref m) if m == "template missing"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/renders"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let provider = HttpRenderProvider::new(fast(HttpProviderConfig::new(
            "generic",
            server.uri(),
            AuthScheme::None,
        )))
        .unwrap();
        let err = provider
            .render(&render_request(), &RecordingProgress::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_poll_budget_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/renders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "slow"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/renders/slow"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "rendering"})))
            .mount(&server)
            .await;

        let provider = HttpRenderProvider::new(fast(HttpProviderConfig::new(
            "generic",
            server.uri(),
            AuthScheme::None,
        )))
        .unwrap();
        let progress = RecordingProgress::default();
        let err = provider
            .render(&render_request(), &progress, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        let values = progress.values();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(values.iter().all(|v| *v < 100));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let err = HttpRenderProvider::new(HttpProviderConfig::new("x", "not a url", AuthScheme::None));
        assert!(matches!(err, Err(ProviderError::Config(_))));
    }
}
