use axum::{middleware, routing::get, Router};

use crate::handlers::{diagnostics, health_check, ready_check, session_participants, session_timing};
use crate::routes::auth_middleware::auth_middleware;
use crate::AppState;

/// Create API routes
pub fn create_api_routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware)); // Applies to all routes added above

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/sessions/:session_id/timing", get(session_timing))
        .route("/v1/sessions/:session_id/participants", get(session_participants))
        .merge(protected)
}
