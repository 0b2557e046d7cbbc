//! Health, status and metrics endpoints.

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;

use crate::metrics::{encode_metrics, set_keys_available};
use crate::state::AppState;
use crate::types::openai::ConductorStatus;

/// Health check endpoint
///
/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "trainforge-conductor"
    }))
}

/// Conductor status: every key's remaining budgets plus totals
///
/// GET /status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<ConductorStatus> {
    let providers = state.ledger.snapshot();
    let available_keys = providers.iter().filter(|key| key.is_available).count();
    set_keys_available(available_keys);

    Json(ConductorStatus {
        status: "running".to_string(),
        scheduling_strategy: state.strategy.to_string(),
        total_providers: state.total_providers,
        total_keys: providers.len(),
        available_keys,
        providers,
    })
}

/// JSON metrics summary
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.stats.lock().await;
    Json(json!({
        "requests_total": stats.requests_total,
        "requests_success": stats.requests_success,
        "requests_failed": stats.requests_failed,
        "tokens_consumed": stats.tokens_consumed,
        "success_rate": stats.success_rate(),
    }))
}

/// Prometheus text exposition
///
/// GET /metrics/prometheus
pub async fn metrics_prometheus() -> impl IntoResponse {
    encode_metrics()
}
