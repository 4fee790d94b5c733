//! switchboard HTTP server.
//!
//! Receives messaging-channel webhooks and operator signals, and exposes
//! a few maintenance routes. The binary in `main.rs` wires configuration,
//! background tasks and the listener around [`router`].

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::Router;
use axum::routing::{get, post};
use state::AppState;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Builds the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/whatsapp", post(routes::webhook))
        .route("/handoff/{identity}", post(routes::mark_handoff))
        .route(
            "/sessions/{identity}",
            get(routes::session_summary).delete(routes::reset_session),
        )
        .route("/health", get(routes::health))
        .route("/debug/tools", get(routes::debug_tools))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
