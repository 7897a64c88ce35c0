use axum::http::{self, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    MissingToken(String),
    #[error("No JWT secret configured!")]
    NoSecret,
    #[error("JWT validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("Can't extract a UID from the JWT token")]
    MissingSubject,
}

/// Identity taken from a verified credential
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedUser {
    pub uid: String,
    pub name: Option<String>,
    pub roles: Vec<String>,
}

// Get the auth token from the request headers
pub fn get_auth_token(headers: &HeaderMap) -> Result<String, AuthError> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthError::MissingToken("Invalid Authorization header".to_string()))?;
        return Ok(auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).to_string());
    }

    // 2. Try to get token from cookies
    let cookie_header = headers
        .get(http::header::COOKIE)
        .ok_or_else(|| AuthError::MissingToken("Missing Authorization header or Cookie".to_string()))?
        .to_str()
        .map_err(|_| AuthError::MissingToken("Invalid Cookie header".to_string()))?;

    cookie::Cookie::split_parse(cookie_header)
        .flatten()
        .find(|c| c.name() == "auth_token")
        .map(|c| c.value().to_string())
        .ok_or_else(|| AuthError::MissingToken("auth_token cookie not found".to_string()))
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}

/// Verify a credential and extract the trusted user id, display name and roles
pub fn verify_token(token: &str, secret: Option<&str>) -> Result<VerifiedUser, AuthError> {
    let secret = secret.ok_or(AuthError::NoSecret)?;
    let token_data = validate_jwt(token, secret)?;
    let claims = &token_data.claims;

    let uid = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::MissingSubject)?
        .to_string();
    let name = claims.get("name").and_then(|v| v.as_str()).map(str::to_string);
    let roles = match claims.get("roles").and_then(|v| v.as_array()) {
        Some(roles_array) => roles_array
            .iter()
            .filter_map(|r| r.as_str().map(|s| s.to_string()))
            .collect::<Vec<String>>(),
        None => Vec::new(),
    };

    info!("JWT token validated successfully for user: {}", uid);
    Ok(VerifiedUser { uid, name, roles })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    pub(crate) fn make_token(secret: &str, claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn verifies_subject_name_and_roles() {
        let token = make_token("s3cret", json!({"sub": "u-1", "name": "Ada", "roles": ["admin"], "exp": exp()}));
        let user = verify_token(&token, Some("s3cret")).unwrap();
        assert_eq!(
            user,
            VerifiedUser {
                uid: "u-1".into(),
                name: Some("Ada".into()),
                roles: vec!["admin".into()],
            }
        );
    }

    #[test]
    fn rejects_wrong_secret_and_missing_subject() {
        let token = make_token("s3cret", json!({"sub": "u-1", "exp": exp()}));
        assert!(matches!(verify_token(&token, Some("other")), Err(AuthError::InvalidToken(_))));
        assert!(matches!(verify_token(&token, None), Err(AuthError::NoSecret)));

        let anonymous = make_token("s3cret", json!({"exp": exp()}));
        assert!(matches!(verify_token(&anonymous, Some("s3cret")), Err(AuthError::MissingSubject)));
    }

    #[test]
    fn token_from_bearer_header_or_cookie() {
        let mut headers = HeaderMap::new();
        assert!(get_auth_token(&headers).is_err());

        headers.insert(http::header::COOKIE, "theme=dark; auth_token=abc".parse().unwrap());
        assert_eq!(get_auth_token(&headers).unwrap(), "abc");

        headers.insert(http::header::AUTHORIZATION, "Bearer xyz".parse().unwrap());
        assert_eq!(get_auth_token(&headers).unwrap(), "xyz");
    }
}
