use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::debug;

use crate::models::{ErrorResponse, ParticipantsUpdate, SessionTimingInfo};
use crate::ws::EngineError;
use crate::AppState;

fn engine_unavailable(e: EngineError) -> (StatusCode, Json<ErrorResponse>) {
    ErrorResponse::with_status(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

/// Timing of a session. Sessions that never started get a fresh default window.
pub async fn session_timing(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionTimingInfo>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Timing requested for session {}", session_id);
    let timing = state.engine.timing(&session_id).await.map_err(engine_unavailable)?;
    Ok(Json(timing))
}

pub async fn session_participants(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ParticipantsUpdate>, (StatusCode, Json<ErrorResponse>)> {
    let participants = state
        .engine
        .participants(&session_id)
        .await
        .map_err(engine_unavailable)?;
    Ok(Json(participants))
}
