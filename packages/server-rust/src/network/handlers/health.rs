//! Probe endpoints and the operator status page.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use super::AppState;

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub state: &'static str,
    /// Manual runs still being answered.
    pub in_flight: u64,
    /// Admission slots left before runs are shed.
    pub run_slots_free: usize,
    pub scheduler: bool,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// Always 200; `state` tells a draining server apart from a ready one.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        state: state.shutdown.health_state().as_str(),
        in_flight: state.shutdown.in_flight_count(),
        run_slots_free: state.pipeline.free_slots(),
        scheduler: state.scheduler.is_some(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// 200 whenever the process answers. Provider reachability is not checked.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 only while new runs are accepted.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.accepting() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus text exposition, or 404 when metrics are disabled.
pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .ok_or(StatusCode::NOT_FOUND)
}
