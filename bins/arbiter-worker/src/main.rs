mod config;
mod dispatch;
mod docker;
mod engine;
mod evaluator;
mod executor;
mod process;
mod runner;
mod sandbox;

#[cfg(test)]
mod engine_tests;

use anyhow::Context;
use arbiter_common::types::Language;
use config::{LanguageConfigManager, SandboxBackend, WorkerSettings};
use dispatch::WorkerPool;
use docker::DockerSandboxProvider;
use engine::JudgingEngine;
use executor::JobContext;
use process::ProcessSandboxProvider;
use sandbox::SandboxProvider;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Arbiter Worker booting...");

    let config = arbiter_common::config::Config::from_env();
    let settings = Arc::new(WorkerSettings::from_env());

    let languages = Arc::new(LanguageConfigManager::load_default().map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        error!("Make sure config/languages.json exists or set LANGUAGES_CONFIG");
        e
    })?);
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    for language in Language::ALL {
        if languages.get_config(&language).is_none() {
            warn!(language = %language, "No runtime configured; its jobs will be judged as compilation errors");
        }
    }

    // Constructed once and shared by every job
    let provider: Arc<dyn SandboxProvider> = match settings.backend {
        SandboxBackend::Docker => Arc::new(
            DockerSandboxProvider::new(languages.clone(), settings.scratch_root.clone())
                .context("Failed to connect to Docker daemon")?,
        ),
        SandboxBackend::Process => Arc::new(ProcessSandboxProvider::new(
            languages.clone(),
            settings.scratch_root.clone(),
        )),
    };
    info!(
        backend = ?settings.backend,
        concurrency = settings.concurrency,
        visibility_timeout_secs = settings.visibility_timeout.as_secs(),
        max_deliveries = settings.max_deliveries,
        scratch_root = %settings.scratch_root.display(),
        "Worker configured"
    );

    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis: {}", config.redis_url);

    let ctx = JobContext {
        engine: Arc::new(JudgingEngine::new(provider)),
        settings,
        result_ttl_seconds: config.result_ttl_seconds,
    };
    let pool = WorkerPool::new(redis_conn, ctx, Language::ALL.to_vec());

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            // Keep the sender alive so workers do not see a closed channel
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, finishing in-flight jobs...");
        let _ = shutdown_tx.send(true);
    });

    pool.run(shutdown_rx).await;

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").map_or(false, |format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}
