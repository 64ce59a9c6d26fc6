use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use tracing::{error, info};

use crate::config;
use crate::services::auth_service::{get_auth_token, resolve_user, AuthError};

/// Bearer-token gate in front of the API and the collaboration socket.
///
/// A request that passes carries the resolved `AuthUser` in its extensions.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    // 1. Get the auth token from the request (header, query or cookie)
    let token = match get_auth_token(&req) {
        Ok(token) => token,
        Err(_) => return Err(StatusCode::UNAUTHORIZED),
    };

    // 2. Validate the token against the configured secret
    let config = config::get_config();
    let secret = match &config.auth_jwt_secret {
        Some(secret) => secret,
        None => {
            error!("Auth JWT secret not configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    // 3. Resolve the user identity from the claims
    let user = match resolve_user(&token, secret) {
        Ok(user) => user,
        Err(AuthError::NoSecret) => {
            error!("Auth JWT secret not configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            error!("Authentication refused: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    info!("Authenticated {} ({})", user.email, user.user_id);

    // 4. Set the user into request extensions for downstream handlers
    req.extensions_mut().insert(user);

    // Token is valid, proceed to the next middleware/handler
    Ok(next.run(req).await)
}
