use crate::{
    handlers::diagnostics, handlers::health_check, handlers::ready_check,
    handlers::websocket_handler, routes::auth_middleware::auth_middleware,
};
use axum::{middleware, routing::get, Router};
use std::sync::Arc;

use crate::collab::CollabEngine;

/// Create API routes
///
/// The collaboration socket sits behind the same bearer-token middleware as
/// the REST surface: an unauthenticated caller is refused before upgrade.
pub fn create_api_routes(engine: Arc<CollabEngine>) -> Router {
    Router::<Arc<CollabEngine>>::new()
        .route("/api/v1/diagnostics", get(diagnostics))
        .route("/ws", get(websocket_handler))
        .route_layer(middleware::from_fn(auth_middleware)) // Applies to all routes added above
        .with_state(engine)
}

/// Create public routes (no authentication)
pub fn create_public_routes(engine: Arc<CollabEngine>) -> Router {
    Router::<Arc<CollabEngine>>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .with_state(engine)
}
