use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Session engine is running", body = ReadyResponse),
        (status = 503, description = "Session engine is not running", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Remaining time and extension budget of a session
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}/timing",
    params(
        ("session_id" = String, Path, description = "Session identifier")
    ),
    responses(
        (status = 200, description = "Session timing, or a fresh default window if the session is not active", body = SessionTimingInfo)
    )
)]
#[allow(dead_code)]
pub async fn session_timing_doc() {}

/// Participants currently joined to a session
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}/participants",
    params(
        ("session_id" = String, Path, description = "Session identifier")
    ),
    responses(
        (status = 200, description = "Participant list ordered by join time", body = ParticipantsUpdate)
    )
)]
#[allow(dead_code)]
pub async fn session_participants_doc() {}

/// Engine and host diagnostics (admin only)
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics", body = DiagnosticsResponse),
        (status = 401, description = "Missing or invalid credential"),
        (status = 403, description = "Admin access required", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        session_timing_doc,
        session_participants_doc,
        diagnostics_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            ErrorResponse,
            SessionTimingInfo,
            ParticipantsUpdate,
            SessionParticipant,
            DiagnosticsResponse
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
