//! Fabula story service.
//!
//! Serves `/api/generate-story` and the story permalink routes on `PORT`
//! (default 8080). Reads the Gemini credential, PostgREST store and
//! `FABULA_*` tuning from the environment; see `AppConfig::from_env`.

use std::env;

use fabula::store::StoryStore as _;
use fabula::{app, build_state_from_env};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Structured logging, filtered by RUST_LOG.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let state = build_state_from_env().await?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        store = state.store.backend(),
        generation = state.orchestrator.is_some(),
        "fabula starting"
    );
    let app = app(state);

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
