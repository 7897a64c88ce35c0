use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{error, info};

use crate::services::auth_service::{get_auth_token, verify_token, AuthError};
use crate::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {

    // 1. Get the auth token from the request
    let token = match get_auth_token(req.headers()) {
        Ok(token) => token,
        Err(_) => return Err(StatusCode::UNAUTHORIZED),
    };

    // 2. Validate Token
    let user = match verify_token(&token, state.config.auth_jwt_secret.as_deref()) {
        Ok(user) => user,
        Err(AuthError::NoSecret) => {
            error!("Auth JWT secret not configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            error!("JWT validation failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    info!("Request authenticated for user {}", user.uid);

    // 3. Hand the identity to downstream handlers
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}
