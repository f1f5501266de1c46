//! HTTP request handlers

use crate::hub::HubHandle;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Shared server state
pub struct ServerState {
    pub hub: HubHandle,
    /// Interval between WebSocket-level pings sent to every connection
    pub ping_interval: Duration,
}

/// Shared broker state
pub type BrokerState = Arc<ServerState>;

/// Connection counts by role
#[derive(Debug, Serialize)]
pub struct ConnectionCounts {
    pub ui: usize,
    pub worker: usize,
    pub unregistered: usize,
}

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<ConnectionCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
}

/// Health check handler.
///
/// Returns:
/// - 200 + `"ok"` with hub counters while the hub actor is running
/// - 503 + `"unhealthy"` if the hub actor has stopped
pub async fn health(State(state): State<BrokerState>) -> (StatusCode, Json<HealthResponse>) {
    let version = env!("CARGO_PKG_VERSION").to_string();
    match state.hub.stats().await {
        Some(stats) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                version,
                connections: Some(ConnectionCounts {
                    ui: stats.ui,
                    worker: stats.worker,
                    unregistered: stats.unregistered,
                }),
                queue_depth: Some(stats.queue_depth),
            }),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy".to_string(),
                version,
                connections: None,
                queue_depth: None,
            }),
        ),
    }
}
