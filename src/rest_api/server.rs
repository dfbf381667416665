//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::StatusRegistry;
use crate::leader::LeaderState;
use crate::{Error, Result};

use super::handlers;

/// Shared state of the HTTP handlers
pub struct ApiState {
    pub leader: LeaderState,
    pub status: Arc<StatusRegistry>,
}

fn router(state: Arc<ApiState>) -> Router {
    let app = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/status", get(handlers::status));
    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(handlers::metrics));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server until `shutdown` fires
pub async fn run_server(
    state: Arc<ApiState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("REST API server stopped");
    Ok(())
}
