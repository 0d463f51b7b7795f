//! Health check handlers for stream consumers.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), which ping the store
//! - Consumer group monitoring (`/stream/info`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::StreamError;
use crate::metrics;
use crate::store::StreamStore;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn StreamStore>,
    pub app_name: String,
    pub app_version: String,
    pub stream_name: String,
    pub group_name: String,
}

impl HealthState {
    pub fn new(
        store: Arc<dyn StreamStore>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        stream_name: impl Into<String>,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            app_name: app_name.into(),
            app_version: app_version.into(),
            stream_name: stream_name.into(),
            group_name: group_name.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler. Always OK while the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler. Ready when the store answers PING.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "redis": "ok" }
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("error: {}", e) }
            })),
        ),
    }
}

/// Consumer group monitoring: every consumer with its pending count and idle time.
pub async fn stream_info_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    match state
        .store
        .consumers_info(&state.stream_name, &state.group_name)
        .await
    {
        Ok(consumers) => {
            let total_pending: u64 = consumers.iter().map(|c| c.pending).sum();
            let consumers: Vec<Value> = consumers
                .iter()
                .map(|c| {
                    json!({
                        "name": c.name,
                        "pending": c.pending,
                        "idle_ms": c.idle.as_millis() as u64,
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "stream": state.stream_name,
                    "group": state.group_name,
                    "pending": total_pending,
                    "consumers": consumers,
                })),
            )
        }
        // Nothing has created the group yet
        Err(StreamError::NoGroup { .. }) => (
            StatusCode::OK,
            Json(json!({
                "stream": state.stream_name,
                "group": state.group_name,
                "pending": 0,
                "consumers": [],
                "message": "Consumer group does not exist yet"
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!("Failed to get consumer info: {}", e)
            })),
        ),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the standard health router.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stream/info", get(stream_info_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
