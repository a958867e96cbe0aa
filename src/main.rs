//! OCR Server - HTTP front end for a PaddleOCR recognition engine.

mod audit;
mod config;
mod error;
mod handlers;
mod normalize;
mod ocr;
mod orientation;
mod rate_limit;
mod response;
mod stats;
mod validation;

use std::net::SocketAddr;
use std::sync::Arc;

use config::ServerConfig;
use handlers::AppState;
use ocr::paddle::PaddleSidecarFactory;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ocr_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::load()?;
    info!(
        "Languages: {:?} (default {}), engine sidecar: {}",
        config.supported_languages, config.default_language, config.engine.sidecar_url
    );

    let factory = Arc::new(PaddleSidecarFactory::new(reqwest::Client::new()));
    let eager_init = config.eager_init;
    let bind_addr = config.bind_addr();
    let state = AppState::new(config, factory);

    if eager_init {
        info!("Pre-loading OCR models...");
        if !state.registry.initialize().await {
            anyhow::bail!("No OCR engine could be initialized");
        }
        info!("OCR models loaded: {:?}", state.registry.loaded_languages());
    } else {
        warn!("Lazy initialization: models load on the first request");
    }

    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
