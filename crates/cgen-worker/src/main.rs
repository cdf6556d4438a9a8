//! Generation pipeline worker binary.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cgen_jobs::JobLifecycle;
use cgen_media::FfmpegRemuxer;
use cgen_providers::{ProviderConfig, ProviderRegistry};
use cgen_queue::{QueueConfig, RedisProgressBus, RedisTaskQueue};
use cgen_storage::{ArtifactStorage, LocalStorage, R2Client};
use cgen_store::{Store, StoreConfig};
use cgen_worker::metrics::install_exporter;
use cgen_worker::{Collaborators, JobExecutor, Orchestrator, WorkerConfig};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cgen=info,sqlx=warn"));

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

/// R2 when configured, local disk otherwise.
fn artifact_storage(config: &WorkerConfig) -> anyhow::Result<Arc<dyn ArtifactStorage>> {
    if std::env::var("R2_ENDPOINT_URL").is_ok() {
        info!("Using R2 artifact storage");
        return Ok(Arc::new(R2Client::from_env()?));
    }
    let root = std::env::var("STORAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config.work_dir.join("artifacts"));
    info!("Using local artifact storage at {:?}", root);
    Ok(Arc::new(LocalStorage::new(root)))
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        install_exporter(port)?;
        info!("Serving metrics on port {}", port);
    }

    if let Err(e) = cgen_media::check_ffmpeg() {
        warn!("Audio regeneration will fail until FFmpeg is installed: {}", e);
    }

    let store = Store::connect(&StoreConfig::from_env()).await?;

    let queue_config = QueueConfig::from_env();
    let max_deliveries = queue_config.max_deliveries;
    let bus = RedisProgressBus::new(&queue_config.redis_url, queue_config.progress_namespace.clone())?;
    let queue = RedisTaskQueue::new(queue_config)?;
    queue.init().await?;
    let queue = Arc::new(queue);

    let lifecycle = Arc::new(JobLifecycle::new(store.clone(), queue.clone(), Arc::new(bus)));

    let registry = ProviderRegistry::from_config(&ProviderConfig::from_env())?;
    info!("Default render provider: {}", registry.default_name());
    let mut collaborators = Collaborators::mock(registry, artifact_storage(&config)?);
    collaborators.remuxer = Arc::new(FfmpegRemuxer::new(config.soft_timeout));

    let orchestrator = Orchestrator::new(lifecycle, collaborators, &config);
    let executor = JobExecutor::new(config, queue, orchestrator, max_deliveries);

    let shutdown = executor.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown.cancel();
    });

    executor.run().await?;
    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting cgen-worker");

    if let Err(e) = run().await {
        error!("Worker error: {:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}
