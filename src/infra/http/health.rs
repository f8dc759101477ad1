use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use devpulse_api_types::{HealthStatus, StatsReport};

use crate::application::error::ErrorReport;

use super::HttpState;

/// `200` while the store answers, `503` once it does not.
pub(super) async fn cache_health(State(state): State<HttpState>) -> Response {
    let report = state.cache.health().report().await;
    if report.status != HealthStatus::Unhealthy {
        return (StatusCode::OK, Json(report)).into_response();
    }

    let detail = report
        .store
        .error
        .clone()
        .unwrap_or_else(|| "store unreachable".to_string());
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(report)).into_response();
    ErrorReport::from_message(
        "infra::http::cache_health",
        StatusCode::SERVICE_UNAVAILABLE,
        detail,
    )
    .attach(&mut response);
    response
}

pub(super) async fn cache_stats(State(state): State<HttpState>) -> Json<StatsReport> {
    Json(state.cache.health().stats())
}
