mod error;
mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use arbiter_common::config::{env_or, Config};
use axum::Router;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub struct AppState {
    pub redis: ConnectionManager,
    pub config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Arbiter API booting...");

    let config = Config::from_env();
    metrics::register_metrics().context("Failed to register metrics")?;

    let client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis: {}", config.redis_url);

    let state = Arc::new(AppState {
        redis: redis_conn,
        config,
    });
    info!(
        result_ttl_seconds = state.config.result_ttl_seconds,
        "Job results expire after TTL"
    );

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr: String = env_or("API_BIND", "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept problems and submissions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("API shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Received shutdown signal, draining connections..."),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if std::env::var("LOG_FORMAT").map_or(false, |format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}
