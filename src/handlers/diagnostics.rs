use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use std::sync::{Arc, Mutex, OnceLock};
use sysinfo::System;
use tracing::{error, info};

use crate::collab::CollabEngine;
use crate::models::{DiagnosticsResponse, ErrorResponse};
use crate::services::auth_service::{ensure_admin, AuthUser};

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Runtime diagnostics for the collaboration service
pub async fn diagnostics(
    State(engine): State<Arc<CollabEngine>>,
    Extension(user): Extension<AuthUser>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {
    // Ensure the caller is an administrator
    ensure_admin(&user)?;

    // Aggregate counters from the engine
    let n_conn = engine.connection_count().await as u32;
    let n_rooms = engine.room_count().await as u32;
    let n_live_locks = match engine.live_lock_count().await {
        Ok(count) => count,
        Err(e) => {
            error!("Failed to count live locks: {}", e);
            0
        }
    };

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Rooms: {}, Locks: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_conn,
        n_rooms,
        n_live_locks
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn,
            n_rooms,
            n_live_locks,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
