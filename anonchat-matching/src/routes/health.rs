use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use anonchat_shared::types::api::{HealthCheck, HealthResponse, HealthStatus};

use crate::AppState;

/// Liveness plus a Redis ping when Redis is the store.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let mut checks = Vec::new();
    if let Some(redis) = &state.redis {
        let check = match redis.ping().await {
            Ok(()) => HealthCheck::healthy("redis"),
            Err(e) => HealthCheck::failed("redis", HealthStatus::Unhealthy, e.to_string()),
        };
        checks.push(check);
    }

    let response = HealthResponse::healthy("anonchat-matching", env!("CARGO_PKG_VERSION")).with_checks(checks);
    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Prometheus exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
