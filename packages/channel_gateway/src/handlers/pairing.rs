use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use channel_supervisor::ChannelId;
use serde_json::json;
use tracing::{info, warn};

use super::{ChannelQuery, timestamp};
use crate::AppState;
use crate::error::ApiError;
use crate::qr;

pub const QR_PENDING: &str = "QR code not available yet, try again in a few seconds";
pub const QR_ALREADY_CONNECTED: &str = "Already connected";

/// Start `id` in the background unless it already has a live connection.
fn start_in_background(state: &AppState, id: &ChannelId) {
    let supervisor = state.supervisor.clone();
    let id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = supervisor.start_channel(&id).await {
            warn!(channel = %id, "Failed to start channel: {}", e);
        }
    });
}

/// Make sure the channel is starting, then wait for a pairing code.
async fn pairing_code(state: &AppState, id: &ChannelId) -> Option<String> {
    let snapshot = state.supervisor.status(id).await;
    if snapshot.connected {
        return None;
    }
    if snapshot.pairing_artifact.is_some() {
        return snapshot.pairing_artifact;
    }
    if !snapshot.status.is_active() {
        if let Err(e) = state.supervisor.start_channel(id).await {
            warn!(channel = %id, "Failed to start channel: {}", e);
        }
    }
    state
        .supervisor
        .wait_for_pairing_artifact(id, state.config.pairing_wait)
        .await
}

/// Kick off the connection and return immediately
pub async fn connect_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = query.channel(&state)?;
    let snapshot = state.supervisor.status(&id).await;

    let message = if snapshot.connected {
        "Already connected".to_string()
    } else if snapshot.status.is_active() {
        format!("Channel {} is already connecting", id)
    } else {
        info!(channel = %id, "Connect requested");
        start_in_background(&state, &id);
        format!("Connecting channel {}, fetch /qr to pair", id)
    };

    Ok(Json(json!({
        "success": true,
        "message": message,
        "timestamp": timestamp(),
    })))
}

/// Pairing code as text, waiting a bounded time for it to appear
pub async fn qr_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = query.channel(&state)?;
    let code = pairing_code(&state, &id).await;
    let connected = state.supervisor.status(&id).await.connected;

    let qr = match code {
        Some(code) => code,
        None if connected => QR_ALREADY_CONNECTED.to_string(),
        None => QR_PENDING.to_string(),
    };

    Ok(Json(json!({
        "success": true,
        "qr": qr,
        "connected": connected,
        "timestamp": timestamp(),
    })))
}

/// Pairing code rendered as a PNG, or a plain-text 404 when there is none
pub async fn qr_png_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> Result<Response, ApiError> {
    let id = query.channel(&state)?;
    let Some(code) = pairing_code(&state, &id).await else {
        let placeholder = if state.supervisor.status(&id).await.connected {
            QR_ALREADY_CONNECTED
        } else {
            QR_PENDING
        };
        return Ok((
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            placeholder,
        )
            .into_response());
    };

    let png = qr::render_png(&code).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        png,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, routing::get};
    use channel_supervisor::{ChannelStatus, ConnectionEvent};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::test_helpers::{connect_channel, json_body, test_app_state, wait_for_status};

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/connect", get(connect_handler))
            .route("/qr", get(qr_handler))
            .route("/qr.png", get(qr_png_handler))
            .with_state(state)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_starts_channel() {
        let (state, connector, _tmp) = test_app_state();
        let app = router(state.clone());

        let resp = app.clone().oneshot(get_req("/connect?port=3001")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["success"], true);
        assert!(json["message"].as_str().unwrap().contains("3001"));

        let id = ChannelId::from(3001);
        wait_for_status(&state, &id, ChannelStatus::Initializing).await;
        assert_eq!(connector.opened_count(), 1);
        assert_eq!(
            connector.latest().unwrap().spec().session_dir,
            state.config.supervisor.sessions_root.join("session-3001")
        );

        // A second connect while initializing does not open another connection
        let resp = app.oneshot(get_req("/connect?port=3001")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.opened_count(), 1);
    }

    #[tokio::test]
    async fn test_qr_returns_pairing_code() {
        let (state, connector, _tmp) = test_app_state();
        let app = router(state.clone());

        let pending = tokio::spawn(app.oneshot(get_req("/qr?port=3000")));
        for _ in 0..100 {
            if connector.opened_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        connector
            .latest()
            .unwrap()
            .emit(ConnectionEvent::PairingCode("ABC123".into()))
            .await;

        let resp = pending.await.unwrap().unwrap();
        let json = json_body(resp).await;
        assert_eq!(json["qr"], "ABC123");
        assert_eq!(json["connected"], false);
    }

    #[tokio::test]
    async fn test_qr_placeholder_when_no_code_arrives() {
        let (state, _connector, _tmp) = test_app_state();
        let resp = router(state).oneshot(get_req("/qr")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["qr"], QR_PENDING);
        assert_eq!(json["connected"], false);
    }

    #[tokio::test]
    async fn test_qr_when_connected() {
        let (state, connector, _tmp) = test_app_state();
        connect_channel(&state, &connector, &ChannelId::from(3000)).await;

        let resp = router(state).oneshot(get_req("/qr")).await.unwrap();
        let json = json_body(resp).await;
        assert_eq!(json["qr"], QR_ALREADY_CONNECTED);
        assert_eq!(json["connected"], true);
    }

    #[tokio::test]
    async fn test_qr_png_renders_image() {
        let (state, connector, _tmp) = test_app_state();
        let id = ChannelId::from(3000);
        state.supervisor.start_channel(&id).await.unwrap();
        connector
            .latest()
            .unwrap()
            .emit(ConnectionEvent::PairingCode("ABC123".into()))
            .await;
        wait_for_status(&state, &id, ChannelStatus::AwaitingPairing).await;

        let resp = router(state).oneshot(get_req("/qr.png")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..4], b"\x89PNG");
    }

    #[tokio::test]
    async fn test_qr_png_placeholder_is_404_text() {
        let (state, _connector, _tmp) = test_app_state();
        let resp = router(state).oneshot(get_req("/qr.png")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], QR_PENDING.as_bytes());
    }
}
