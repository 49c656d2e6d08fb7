use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde_json::json;

use super::{ChannelQuery, timestamp};
use crate::AppState;
use crate::error::ApiError;

/// Health check - channel status plus the backend's live state, best effort
pub async fn health_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = query.channel(&state)?;
    let snapshot = state.supervisor.refresh_status(&id).await;

    Ok(Json(json!({
        "success": true,
        "channel": snapshot.id,
        "status": snapshot.status,
        "connected": snapshot.connected,
        "lastState": snapshot.live_state.unwrap_or_else(|| snapshot.status.to_string()),
        "retryCount": snapshot.retry_count,
        "lastError": snapshot.last_error,
        "timestamp": timestamp(),
    })))
}

/// Cached status only; never touches the backend
pub async fn status_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = query.channel(&state)?;
    let snapshot = state.supervisor.status(&id).await;

    Ok(Json(json!({
        "success": true,
        "connected": snapshot.connected,
        "status": snapshot.status,
        "timestamp": timestamp(),
    })))
}

pub async fn channels_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "channels": state.supervisor.list().await,
        "timestamp": timestamp(),
    }))
}
