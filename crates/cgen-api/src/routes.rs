//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::admin::{get_queue_status, retry_job};
use crate::handlers::jobs::{create_copy_job, create_image_job, get_job, job_events, list_jobs};
use crate::handlers::projects::{
    create_project, get_project, get_video, list_audio_tracks, regenerate_audio, render_project,
};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging};
use crate::state::AppState;
use crate::ws::ws_job_events;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let job_routes = Router::new()
        .route("/copy/jobs", post(create_copy_job))
        .route("/image/jobs", post(create_image_job))
        .route("/jobs/:task_type", get(list_jobs))
        .route("/jobs/:task_type/:task_id", get(get_job))
        .route("/jobs/:task_type/:task_id/events", get(job_events));

    let video_routes = Router::new()
        .route("/video/projects", post(create_project))
        .route("/video/projects/:project_id", get(get_project))
        .route("/video/projects/:project_id/render", post(render_project))
        .route("/video/videos/:video_id", get(get_video))
        .route(
            "/video/videos/:video_id/audio",
            post(regenerate_audio).get(list_audio_tracks),
        );

    let admin_routes = Router::new()
        .route("/admin/jobs/:task_type/:task_id/retry", post(retry_job))
        .route("/admin/queue/status", get(get_queue_status));

    let api_routes = Router::new()
        .merge(job_routes)
        .merge(video_routes)
        .merge(admin_routes);

    let ws_routes = Router::new().route("/ws/jobs/:task_type/:task_id", get(ws_job_events));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    // Metrics endpoint (if enabled)
    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(ws_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use cgen_jobs::JobLifecycle;
    use cgen_models::{JobRef, JobTable, ProjectStatus, TaskId, WorkspaceId};
    use cgen_queue::{InMemoryProgressBus, InMemoryTaskQueue};
    use cgen_store::Store;

    use super::*;
    use crate::config::ApiConfig;

    struct TestApp {
        router: Router,
        lifecycle: Arc<JobLifecycle>,
        queue: Arc<InMemoryTaskQueue>,
    }

    async fn app() -> TestApp {
        let store = Store::in_memory().await.unwrap();
        let queue = Arc::new(InMemoryTaskQueue::new());
        let lifecycle = Arc::new(JobLifecycle::new(
            store,
            queue.clone(),
            Arc::new(InMemoryProgressBus::default()),
        ));
        let state = AppState::new(ApiConfig::default(), lifecycle.clone());
        TestApp {
            router: create_router(state, None),
            lifecycle,
            queue,
        }
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Workspace-Id", "ws-1")
            .header("X-User-Id", "user-1");
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn copy_ref(task_id: &str) -> JobRef {
        JobRef::new(JobTable::Copy, WorkspaceId::from("ws-1"), TaskId::from(task_id))
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_missing_tenancy_headers_rejected() {
        let app = app().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/copy/jobs")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "product_name": "Lamp" }).to_string()))
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(app.queue.ready_tasks().len(), 0);
    }

    #[tokio::test]
    async fn test_create_copy_job_enqueues() {
        let app = app().await;
        let (status, body) = send(
            &app,
            request("POST", "/api/copy/jobs", Some(json!({ "product_name": "Lamp" }))),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "PENDING");
        assert_eq!(app.queue.ready_tasks().len(), 1);

        let task_id = body["task_id"].as_str().unwrap();
        let (status, job) = send(&app, request("GET", &format!("/api/jobs/copy/{}", task_id), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["kind"], "copy");
        assert_eq!(job["progress"], 0);
    }

    #[tokio::test]
    async fn test_invalid_request_creates_no_job() {
        let app = app().await;
        let (status, _) = send(
            &app,
            request("POST", "/api/image/jobs", Some(json!({ "prompt": "", "count": 40 }))),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(app.queue.ready_tasks().len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_bad_request() {
        let app = app().await;
        let (status, _) = send(&app, request("GET", "/api/jobs/podcast/abc", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_other_workspace_cannot_read_job() {
        let app = app().await;
        let (_, body) = send(
            &app,
            request("POST", "/api/copy/jobs", Some(json!({ "product_name": "Lamp" }))),
        )
        .await;
        let task_id = body["task_id"].as_str().unwrap();

        let req = Request::builder()
            .uri(format!("/api/jobs/copy/{}", task_id))
            .header("X-Workspace-Id", "ws-2")
            .header("X-User-Id", "user-2")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_project_then_render_requires_script() {
        let app = app().await;
        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/video/projects",
                Some(json!({ "name": "Desk lamp", "features": ["dimmable"], "target_duration": 30 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "PENDING");
        let project_id = body["project_id"].as_str().unwrap().to_string();

        let (status, project) =
            send(&app, request("GET", &format!("/api/video/projects/{}", project_id), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(project["status"], ProjectStatus::Pending.as_str());

        let (status, _) = send(
            &app,
            request("POST", &format!("/api/video/projects/{}/render", project_id), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        // Only the script task was queued
        assert_eq!(app.queue.ready_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_audio_for_unknown_video_is_not_found() {
        let app = app().await;
        let (status, _) = send(
            &app,
            request("POST", "/api/video/videos/nope/audio", Some(json!({ "voice": "nova" }))),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_unless_forced() {
        let app = app().await;
        let (_, body) = send(
            &app,
            request("POST", "/api/copy/jobs", Some(json!({ "product_name": "Lamp" }))),
        )
        .await;
        let task_id = body["task_id"].as_str().unwrap().to_string();
        let retry_uri = format!("/api/admin/jobs/copy/{}/retry", task_id);

        let (status, _) = send(&app, request("POST", &retry_uri, Some(json!({})))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let job_ref = copy_ref(&task_id);
        app.lifecycle.start(&job_ref).await.unwrap();
        app.lifecycle.fail(&job_ref, "provider unavailable").await.unwrap();

        let (status, outcome) = send(&app, request("POST", &retry_uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["success"], true);
        assert_eq!(outcome["old_status"], "FAILED");
        assert_eq!(outcome["new_status"], "PENDING");

        let job = app.lifecycle.get(&job_ref).await.unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_sse_stream_of_finished_job() {
        let app = app().await;
        let (_, body) = send(
            &app,
            request("POST", "/api/copy/jobs", Some(json!({ "product_name": "Lamp" }))),
        )
        .await;
        let task_id = body["task_id"].as_str().unwrap().to_string();
        let job_ref = copy_ref(&task_id);
        app.lifecycle.start(&job_ref).await.unwrap();
        app.lifecycle
            .complete(&job_ref, &json!({ "variants": ["Bright ideas"] }))
            .await
            .unwrap();

        let response = app
            .router
            .clone()
            .oneshot(request("GET", &format!("/api/jobs/copy/{}/events", task_id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let snapshot = text.find("event: snapshot").unwrap();
        let closed = text.find("event: closed").unwrap();
        assert!(snapshot < closed);
        assert!(text.contains("Bright ideas"));
    }
}
