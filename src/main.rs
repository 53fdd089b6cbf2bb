use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::{CorsLayer, Any};
use tracing_subscriber::{fmt, EnvFilter};

use placement_studio::config::Config;
use placement_studio::gemini::{GeminiClient, ImageGenerator};
use placement_studio::placeholder::PlaceholderGenerator;
use placement_studio::routes::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    let generator: Arc<dyn ImageGenerator> = match &config.api_key {
        Some(key) => {
            let shown: String = key.chars().take(6).collect();
            tracing::info!("Using API key: {}... with model {}", shown, config.model);
            Arc::new(GeminiClient::new(key.clone(), &config))
        }
        None => {
            tracing::warn!("GEMINI_API_KEY is not set, serving placeholder images");
            Arc::new(PlaceholderGenerator)
        }
    };

    let app = router(AppState::new(generator), config.max_upload_bytes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        );

    let addr = SocketAddr::from(([0,0,0,0], config.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
