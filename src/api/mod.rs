//! Exposed HTTP surface of the daemon: health and version endpoints.

pub mod health;

pub use health::HealthState;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the router for the health surface
pub fn create_router(health: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .layer(TraceLayer::new_for_http())
        .with_state(health)
}
