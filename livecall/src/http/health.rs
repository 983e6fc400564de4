//! Health check endpoints
//!
//! Liveness and readiness endpoints for orchestrators.

use axum::{response::IntoResponse, routing::get, Router};
use livecall_sfu::TransportFactory;

use crate::http::AppState;

/// Health check router
pub fn create_health_router<T: TransportFactory>() -> Router<AppState<T>> {
    Router::new().route("/health", get(health_check))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}
