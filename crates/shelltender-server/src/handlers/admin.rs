//! Admin HTTP surface and the doctor endpoint

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sysinfo::{System, SystemExt};
use tracing::warn;

/// Tail size of `recentOutput` in the session detail reply.
const RECENT_OUTPUT_BYTES: usize = 4096;

/// GET /api/admin/sessions
pub async fn list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.manager.get_all().await;
    let metas: Vec<serde_json::Value> = sessions
        .iter()
        .map(|session| {
            json!({
                "session": session,
                "bufferSize": state.buffers.retained_bytes(&session.id),
                "lastSequence": state.buffers.last_seq(&session.id),
                "subscribers": state.registry.subscriber_count(&session.id),
            })
        })
        .collect();

    let mut system = System::new();
    system.refresh_memory();
    Json(json!({
        "sessions": metas,
        "system": {
            "totalMemory": system.total_memory(),
            "platform": std::env::consts::OS,
        },
    }))
}

/// GET /api/admin/sessions/:id
pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(session) = state.manager.get(&id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("session not found: {id}")})),
        );
    };

    let snapshot = state.buffers.get_full(&id);
    let tail_start = snapshot.data.len().saturating_sub(RECENT_OUTPUT_BYTES);
    let recent = String::from_utf8_lossy(&snapshot.data[tail_start..]).into_owned();
    let env = session.env.clone();

    (
        StatusCode::OK,
        Json(json!({
            "session": session,
            "env": env,
            "bufferSize": snapshot.data.len(),
            "lastSequence": snapshot.last_seq,
            "recentOutput": recent,
        })),
    )
}

/// DELETE /api/admin/sessions/:id
pub async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.manager.kill(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    pub action: String,
    #[serde(default)]
    pub session_ids: Vec<String>,
}

/// POST /api/admin/sessions/bulk
pub async fn bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if request.action != "kill" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown bulk action: {}", request.action)})),
        );
    }

    let total = request.session_ids.len();
    let mut killed = 0usize;
    for id in &request.session_ids {
        match state.manager.kill(id).await {
            Ok(()) => killed += 1,
            Err(e) => warn!("bulk kill of {} failed: {}", id, e),
        }
    }
    (StatusCode::OK, Json(json!({"killed": killed, "total": total})))
}

/// POST /api/admin/sessions/kill-all
pub async fn kill_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.manager.get_all().await;
    let total = sessions.len();
    let mut killed = 0usize;
    for session in sessions {
        match state.manager.kill(&session.id).await {
            Ok(()) => killed += 1,
            Err(e) => warn!("kill-all of {} failed: {}", session.id, e),
        }
    }
    Json(json!({"killed": killed, "total": total}))
}

/// GET /api/shelltender/doctor
pub async fn doctor(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.manager.get_all().await;
    let retained_total: usize = sessions
        .iter()
        .map(|s| state.buffers.retained_bytes(&s.id))
        .sum();

    let data_dir_writable = std::fs::metadata(state.store.dir())
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false);

    let mut suggestions: Vec<String> = Vec::new();
    if state.config.monitor_auth_key.is_none() {
        suggestions.push(
            "SHELLTENDER_MONITOR_AUTH_KEY is not set; monitor-all and admin messages are limited"
                .to_string(),
        );
    }
    if !data_dir_writable {
        suggestions.push(format!(
            "data directory {:?} is not writable; session persistence will fail",
            state.store.dir()
        ));
    }
    if sessions.len() >= state.config.max_sessions {
        suggestions.push("session limit reached; new create requests will fail".to_string());
    }

    // Never echo the monitor key back out.
    let mut config = (*state.config).clone();
    config.monitor_auth_key = config.monitor_auth_key.map(|_| "***".to_string());

    let status = if data_dir_writable { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "checks": {
            "server": {
                "status": "ok",
                "uptimeSecs": state.started_at.elapsed().as_secs(),
            },
            "websocket": {
                "status": "ok",
                "clients": state.registry.client_count(),
                "path": state.config.ws_path,
            },
            "pipeline": {
                "status": "ok",
                "enabled": state.config.enable_pipeline,
            },
            "sessionManager": {
                "status": "ok",
                "sessions": sessions.len(),
                "maxSessions": state.config.max_sessions,
            },
            "bufferManager": {
                "status": "ok",
                "retainedBytes": retained_total,
                "capacityBytes": state.config.buffer_cap,
            },
        },
        "config": config,
        "suggestions": suggestions,
    }))
}
