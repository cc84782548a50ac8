//! HTTP and WebSocket handlers

pub mod admin;
pub mod sessions;
pub mod ws;

use crate::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::json;

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "wsPath": state.config.ws_path,
    }))
}
