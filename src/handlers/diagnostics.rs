use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::auth::auth;
use crate::models::{DiagnosticsResponse, ErrorResponse};
use crate::services::auth_service::VerifiedUser;
use crate::AppState;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Engine counters and host load, for admins
pub async fn diagnostics(
    State(state): State<AppState>,
    Extension(user): Extension<VerifiedUser>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {

    // Ensure the caller is an admin
    let _ = auth::ensure_admin(&user.roles)?;

    let stats = state
        .engine
        .stats()
        .await
        .map_err(|e| ErrorResponse::with_status(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
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
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Active sessions: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.connections,
        stats.active_sessions
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn: count(stats.connections),
            n_active_sessions: count(stats.active_sessions),
            n_ended_sessions: count(stats.ended_sessions),
            n_participants: count(stats.participants),
            n_observers: count(stats.observers),
            n_video_peers: count(stats.video_peers),
            n_documents: count(stats.documents),
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
