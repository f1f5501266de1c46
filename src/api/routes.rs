//! API route definitions

use super::handlers::{self, BrokerState};
use super::ws_handlers;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the broker router
pub fn create_router(state: BrokerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // Hub endpoint for both ui and worker clients
        .route("/ws", get(ws_handlers::ws_hub))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
