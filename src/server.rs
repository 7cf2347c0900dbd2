//! HTTP probe surface: `GET /health` and `GET /metrics`

use crate::reporter::HealthReporter;
use crate::store::LocationStore;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use tracing::debug;

async fn health<S: LocationStore + 'static>(
    State(reporter): State<Arc<HealthReporter<S>>>,
) -> impl IntoResponse {
    let report = reporter.liveness().await;
    let code = if report.status.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    debug!(status = ?report.status, "Health probe");
    (code, Json(report))
}

async fn metrics<S: LocationStore + 'static>(
    State(reporter): State<Arc<HealthReporter<S>>>,
) -> impl IntoResponse {
    Json(reporter.metrics())
}

pub fn router<S: LocationStore + 'static>(reporter: Arc<HealthReporter<S>>) -> Router {
    Router::new()
        .route("/health", get(health::<S>))
        .route("/metrics", get(metrics::<S>))
        .with_state(reporter)
}
