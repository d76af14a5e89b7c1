use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::router::AppState;

// Handler for GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "background_tasks": state.manager.is_running(),
    }))
}

// Handler for GET /v0/stats
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.stats())
}
