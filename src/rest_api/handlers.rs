//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::extract::State;
#[cfg(feature = "metrics")]
use axum::http::StatusCode;
use axum::Json;
#[cfg(feature = "metrics")]
use tracing::error;
use tracing::instrument;

use super::dto::{EntityStatusResponse, HealthResponse, StatusResponse};
use super::server::ApiState;

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.leader.is_leader(),
    })
}

/// Entities currently being retried, with their last error
#[instrument(skip(state))]
pub async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let retrying = state
        .status
        .retrying()
        .into_iter()
        .map(|(id, status)| EntityStatusResponse {
            namespace: id.namespace().map(str::to_string),
            name: id.name().to_string(),
            attempt: status.attempt,
            next_fire_at: status.next_fire_at,
            last_error: status.last_error,
        })
        .collect();

    Json(StatusResponse {
        leader: state.leader.is_leader(),
        tracked: state.status.len(),
        retrying,
    })
}

/// Prometheus text exposition
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    crate::controller::metrics::render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
