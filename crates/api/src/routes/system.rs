//! Health and Prometheus endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` when every subscription is being consumed, `degraded` otherwise.
    pub status: &'static str,
    pub subscriptions: BTreeMap<String, bool>,
}

/// GET /health: reports which subscriptions are running.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let mut subscriptions = BTreeMap::new();
    for name in state.orchestrator.subscriptions() {
        let running = state.orchestrator.is_running(name).await;
        subscriptions.insert(name.clone(), running);
    }

    let status = if subscriptions.values().all(|running| *running) {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        subscriptions,
    })
}

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics_handle.render(),
    )
}
