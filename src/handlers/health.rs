use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, warn};

use crate::models::{ErrorResponse, HealthResponse, ReadyResponse};
use crate::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        service: env!("CARGO_PKG_NAME").to_string(),
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint. Ready once the session engine answers.
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Readiness check requested");
    match state.engine.stats().await {
        Ok(_) => Ok(Json(ReadyResponse {
            status: "ok".to_string(),
            message: "Service is ready".to_string(),
            store: state.store_kind.to_string(),
        })),
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            Err(ErrorResponse::with_status(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}
