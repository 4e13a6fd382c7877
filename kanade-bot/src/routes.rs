//! Liveness HTTP endpoint.
//!
//! Free hosting tiers stop processes that do not answer HTTP, so the bot
//! serves a single plain-text route next to the gateway connection.

use axum::{http::StatusCode, routing::get, Router};
use kanade_common::config::ServerConfig;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;

pub const LIVENESS_TEXT: &str = "Kanade online.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn liveness() -> &'static str {
    LIVENESS_TEXT
}

/// Build the liveness router.
pub fn build_router() -> Router {
    Router::new()
        .route("/", get(liveness))
        .layer(timeout_layer(REQUEST_TIMEOUT))
}

/// Requests slower than `timeout` are answered with 408.
fn timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

/// Serve the liveness router on `host:port` until `shutdown` fires.
pub async fn serve(config: &ServerConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Starting HTTP server on {}", addr);

    axum::serve(listener, build_router())
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
