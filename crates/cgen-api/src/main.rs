//! Axum API server binary.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cgen_api::{create_router, metrics, ApiConfig, AppState};
use cgen_jobs::{StaleJobSweeper, SweeperConfig};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cgen=info,sqlx=warn,tower_http=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ApiConfig::from_env();
    info!("API config: host={}, port={}", config.host, config.port);

    let state = AppState::from_env(config.clone()).await?;

    let metrics_handle = if config.metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics()?)
    } else {
        None
    };

    let shutdown = CancellationToken::new();

    let sweeper = StaleJobSweeper::new(state.lifecycle.clone(), SweeperConfig::from_env());
    let sweeper_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { sweeper.run(shutdown).await }
    });

    let store = state.store().clone();
    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = sweeper_task.await;
    store.close().await;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Install rustls crypto provider (required for rustls 0.23+)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    init_tracing();
    info!("Starting cgen-api");

    if let Err(e) = run().await {
        error!("API error: {:#}", e);
        std::process::exit(1);
    }

    info!("Server shutdown complete");
}
