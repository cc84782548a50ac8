//! Public session endpoints

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;
use shelltender_types::Session;

/// GET /api/sessions
pub async fn list(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.manager.get_all().await)
}

/// DELETE /api/sessions/:id
pub async fn delete(
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
