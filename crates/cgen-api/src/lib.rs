//! Axum HTTP API server.
//!
//! This crate provides:
//! - Job creation endpoints for copy, image and video generation
//! - Job polling and snapshot-then-subscribe streaming over SSE and WebSocket
//! - The operator retry endpoint
//! - Health, readiness and Prometheus metrics

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod stream;
pub mod ws;

pub use config::ApiConfig;
pub use context::WorkspaceContext;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
