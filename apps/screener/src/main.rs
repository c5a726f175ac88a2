mod config;
mod errors;
mod llm_client;
mod pipeline;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::llm_client::LlmClient;
use crate::pipeline::backoff::RetryPolicies;
use crate::pipeline::classifier::ResponseClassifier;
use crate::pipeline::manager::RetryQueueManager;
use crate::pipeline::store::JsonFileStore;
use crate::pipeline::Orchestrator;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting screener v{}", env!("CARGO_PKG_VERSION"));

    // Recover queue state
    let store = Arc::new(JsonFileStore::new(&config.state_path));
    info!("State file: {}", store.path().display());
    let manager = RetryQueueManager::open(store, RetryPolicies::default())
        .with_context(|| format!("failed to open state at {}", config.state_path.display()))?;

    // Initialize LLM client
    let llm = LlmClient::new(config.anthropic_api_key.clone(), config.llm_model.clone())
        .context("failed to build HTTP client")?
        .with_job_description(config.job_description.clone());
    info!("LLM client initialized (model: {})", config.llm_model);

    let engine = Arc::new(Orchestrator::new(
        Arc::new(manager),
        Arc::new(llm),
        ResponseClassifier::new(config.min_quality_score),
        config.low_quality_policy,
        config.model_class,
        config.engine,
        config.tick_interval,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));

    // Build router
    let app = build_router(AppState::new(engine))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    scheduler.await.context("scheduler task panicked")?;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
