use axum::{Json, http::StatusCode};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub timestamp: i64,
    pub backend_status: Option<String>,
    pub writable: bool,
}

#[axum::debug_handler]
pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> (StatusCode, Json<HealthCheckResponse>) {
    let backend_status = if state.backend.healthy().await {
        Some("connected".to_string())
    } else {
        None
    };

    let status = if backend_status.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthCheckResponse {
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            backend_status,
            writable: state.config.writable,
        }),
    )
}
