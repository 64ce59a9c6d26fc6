use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use tracing::debug;

use crate::collab::CollabEngine;
use crate::config;
use crate::models::{HealthResponse, ReadyResponse};

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        service: config::get_config().service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check endpoint. Ready means the backing store answers.
pub async fn ready_check(
    State(engine): State<Arc<CollabEngine>>,
) -> (StatusCode, Json<ReadyResponse>) {
    debug!("Readiness check requested");
    if engine.store_ready().await {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ok".to_string(),
                database: "ok".to_string(),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "unavailable".to_string(),
                database: "unreachable".to_string(),
            }),
        )
    }
}
