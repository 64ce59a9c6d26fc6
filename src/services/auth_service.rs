use axum::http::{self, StatusCode};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::models::ErrorResponse;

const ADMIN_ROLE: &str = "admin";
const DEFAULT_ROLE: &str = "user";

/// Identity resolved from a bearer token at the connection handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials: {0}")]
    MissingToken(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("JWT secret not configured")]
    NoSecret,
}

/// Get the auth token from a request.
///
/// Checked in order: Authorization header, `token` query parameter (browser
/// WebSocket clients cannot set headers), `auth_token` cookie.
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, AuthError> {
    // 1. Try to get the token from the Authorization header
    if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthError::MissingToken("Invalid Authorization header".to_string()))?;
        return Ok(auth_str
            .strip_prefix("Bearer ")
            .unwrap_or(auth_str)
            .to_string());
    }

    // 2. Try to get the token from the query string
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some((name, value)) = pair.split_once('=') {
                if name == "token" && !value.is_empty() {
                    return Ok(value.to_string());
                }
            }
        }
    }

    // 3. Try to get the token from cookies
    let cookie_header = req
        .headers()
        .get(http::header::COOKIE)
        .ok_or_else(|| {
            AuthError::MissingToken("Missing Authorization header or Cookie".to_string())
        })?
        .to_str()
        .map_err(|_| AuthError::MissingToken("Invalid Cookie header".to_string()))?;

    for cookie in cookie::Cookie::split_parse(cookie_header).flatten() {
        if cookie.name() == "auth_token" {
            return Ok(cookie.value().to_string());
        }
    }
    Err(AuthError::MissingToken(
        "auth_token cookie not found".to_string(),
    ))
}

/// Validate a JWT token and return the token data
pub fn validate_jwt(
    token: &str,
    secret: &str,
) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}

/// Resolve a bearer token to an authenticated user.
///
/// Claims consumed: `sub` (user id, required), `email` (required), `role`
/// (optional, defaults to "user").
pub fn resolve_user(token: &str, secret: &str) -> Result<AuthUser, AuthError> {
    let token_data =
        validate_jwt(token, secret).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

    let user_id = token_data
        .claims
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::InvalidToken("missing 'sub' claim".to_string()))?
        .to_string();

    let email = token_data
        .claims
        .get("email")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::InvalidToken("missing 'email' claim".to_string()))?
        .to_string();

    let role = token_data
        .claims
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_ROLE)
        .to_string();

    info!("JWT token validated successfully for user: {}", user_id);

    Ok(AuthUser {
        user_id,
        email,
        role,
    })
}

/// Ensure the caller holds the admin role.
pub fn ensure_admin(user: &AuthUser) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if user.is_admin() {
        return Ok(());
    }

    let status = StatusCode::FORBIDDEN;
    Err((
        status,
        Json(ErrorResponse {
            code: status.as_u16(),
            status: status.to_string(),
            error: "Administrator access required".to_string(),
        }),
    ))
}
