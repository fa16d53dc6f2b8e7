//! Health and cache metrics

use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use tally_core::{FastStoreMetrics, HealthReport, HealthStatus};

/// 200 unless some component is unhealthy
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.orchestrator.health().await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

pub async fn metrics(State(state): State<AppState>) -> Json<FastStoreMetrics> {
    Json(state.orchestrator.fast_store_metrics())
}
