use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde_json::{Value, json};

pub struct HealthState {
    pub registry: Arc<Registry>,
    /// Flipped once the TLS listener is bound.
    pub ready: Arc<AtomicBool>,
}

pub type SharedHealthState = Arc<HealthState>;

/// Liveness probe served next to the webhook routes.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz(State(state): State<SharedHealthState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "webhook listener not bound")
    }
}

pub async fn metrics_handler(State(state): State<SharedHealthState>) -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state.registry) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response();
    }
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}
