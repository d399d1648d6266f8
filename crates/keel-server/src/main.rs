use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use keel_client::{HtmdCleaner, OpenAiInference, ReqwestFetcher};
use keel_core::config::EngineConfig;
use keel_core::pipeline::ListingPipeline;
use keel_core::scrape::ResilientFetcher;
use keel_core::{JobApi, JobRegistry, JobRunner, RateLimiter, RequestMonitor};
use keel_server::config::ServerConfig;
use keel_server::routes;
use keel_server::state::AppState;
use keel_store::StoreConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("keel=info".parse()?))
        .with_target(false)
        .init();

    let server = ServerConfig::from_env()?;
    let engine = EngineConfig::from_env()?;
    let store_config = StoreConfig::from_env()?;

    let store = store_config.open().await?;
    if let Err(e) = store.secondary().purge_expired().await {
        tracing::warn!(error = %e, "Could not purge expired fallback records");
    }
    let registry = JobRegistry::new(store).with_ttl(store_config.job_ttl);

    let limiter = RateLimiter::new(engine.rate.clone());
    let monitor = RequestMonitor::new();

    let scraper = ResilientFetcher::new(ReqwestFetcher::new()?, engine.scrape.clone(), monitor.clone());
    let inference =
        OpenAiInference::with_base_url(&server.inference_api_key, &server.model, &server.base_url)?;
    let pipeline = ListingPipeline::new(
        scraper,
        HtmdCleaner::new(),
        inference,
        limiter.clone(),
        monitor.clone(),
        engine.listing.clone(),
    );
    let runner = JobRunner::new(registry, pipeline);

    let jobs: Arc<dyn JobApi> = Arc::new(runner.clone());
    let state = Arc::new(AppState {
        jobs,
        monitor,
        limiter,
        api_key: server.api_key.clone(),
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", server.port);
    tracing::info!(model = %server.model, "Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if !runner.shutdown(server.shutdown_grace).await {
        tracing::warn!("Grace period elapsed with jobs still running; they will be left as processing");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
