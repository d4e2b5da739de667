pub mod auth;
pub mod clock;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod protocol;
pub mod rate_limit;
pub mod rendezvous;
pub mod rooms;
pub mod state;
pub mod websocket;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use crate::state::{AppState, SharedState};

/// Assemble the HTTP + signaling router over the shared collaborators.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/bootstrap", get(handlers::bootstrap))
        .route("/rendezvous/register", post(handlers::rendezvous_register))
        .route("/rendezvous/discover", get(handlers::rendezvous_discover))
        .route("/signal", get(websocket::signal_handler))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(middleware::from_fn(handlers::cors))
        .layer(TraceLayer::new_for_http())
}
