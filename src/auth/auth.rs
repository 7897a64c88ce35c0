use axum::{http::StatusCode, Json};
use crate::models::ErrorResponse;

const ADMIN_ROLE: &str = "admin";

pub fn is_admin(roles: &[String]) -> bool {
    roles.iter().any(|r| r == ADMIN_ROLE)
}

pub fn ensure_admin(roles: &[String]) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    if is_admin(roles) {
        return Ok(ADMIN_ROLE.to_string());
    }
    Err(ErrorResponse::with_status(StatusCode::FORBIDDEN, "Admin access required"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_admin_role_passes() {
        assert!(ensure_admin(&["admin".to_string()]).is_ok());
        let (status, _) = ensure_admin(&["editor".to_string()]).unwrap_err();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!is_admin(&[]));
    }
}
