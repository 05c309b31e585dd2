//! Library half of the `relaysync-server` binary: router assembly lives
//! here so HTTP-level tests can drive it with `tower::ServiceExt::oneshot`
//! without spawning a real listener.

pub mod config;
pub mod dashboard;
pub mod errors;
pub mod state;
pub mod webhook;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/webhook/{node_name}", post(webhook::handle_webhook))
        .route("/api/status", get(dashboard::status))
        .route("/api/queue", get(dashboard::queue))
        .route("/api/events/pending", get(dashboard::events_pending))
        .route("/api/events/waiting", get(dashboard::events_waiting))
        .route("/api/sync-log", get(dashboard::sync_log))
        .route("/healthz", get(dashboard::healthz))
        .route("/readyz", get(dashboard::readyz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
