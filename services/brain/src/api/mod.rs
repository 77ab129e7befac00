//! HTTP API handlers and routing.

pub mod error;
mod callbacks;
mod health;
mod instances;
mod nodes;
mod request_context;
mod templates;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        // Health endpoints
        .merge(health::routes())
        // Fleet resources
        .nest("/api/nodes", nodes::routes().merge(callbacks::routes()))
        .nest("/api/instances", instances::routes())
        .nest("/api/templates", templates::routes())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Application state
        .with_state(state)
}
