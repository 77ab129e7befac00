//! HTTP API handlers and routing.
//!
//! The agent's surface is brain-facing only: instance commands, cache
//! administration, and health probes.

pub mod error;
mod cache;
mod health;
mod instances;
mod request_context;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/api/instances", instances::routes())
        .nest("/api/cache", cache::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
