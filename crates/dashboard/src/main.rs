mod advisory;
mod config;
mod connection;
mod engine;
mod error;
mod format;
mod logging;
mod model;
mod publisher;
mod recency;
mod render;
mod router;
mod state;
mod topics;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

use advisory::OpenRouterClient;
use engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "dashboard.toml".to_string());
    let cfg = config::load_or_default(&config_path)?;

    // ── Advisory client ─────────────────────────────────────────────
    let api_key = cfg.advisory_api_key();
    if api_key.is_none() {
        warn!(
            var = %cfg.advisory.api_key_env,
            "advisory API key not set; recommendations will fail"
        );
    }
    let source = OpenRouterClient::new(&cfg.advisory, api_key)
        .context("failed to build advisory client")?;

    // ── Engine ──────────────────────────────────────────────────────
    let engine = Engine::start(&cfg, Arc::new(source))?;
    info!(
        client_id = engine.client_id(),
        sensors = %engine.topics().sensors,
        "dashboard engine started"
    );

    // ── Web server (runs until Ctrl-C) ──────────────────────────────
    let served = web::serve(
        web::AppState::from_engine(&engine),
        cfg.web.port,
        shutdown_signal(),
    )
    .await;

    engine.shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("ctrl-c received");
}
