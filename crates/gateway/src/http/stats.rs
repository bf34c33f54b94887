use axum::{Json, extract::{Path, State}};

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /rooms/stats` — one entry per live room plus worker pool load.
pub async fn rooms_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.registry.stats().await)
}

/// `GET /rooms/{session_id}/stats` — one room's detail.
pub async fn room_stats(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state.registry.find(&session_id)?;
    Ok(Json(room.stats().await))
}
