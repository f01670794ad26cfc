//! API route definitions

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/current", get(handlers::current))
        .route("/api/pool", get(handlers::pool))
        .route("/api/rotate", post(handlers::rotate))
        .route("/api/status", post(handlers::status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
