//! HTTP and WebSocket surface of the broker

pub mod handlers;
pub mod routes;
pub mod ws_handlers;

pub use handlers::{BrokerState, ServerState};
pub use routes::create_router;
