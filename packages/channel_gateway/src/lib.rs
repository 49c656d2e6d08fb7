//! Channel Gateway - HTTP surface over supervised WhatsApp channels
//!
//! Every route takes an optional `?port=<channel>` query parameter selecting
//! the channel it acts on; without it the gateway's own listen port is used.
//! Connection lifecycle lives in [`channel_supervisor`], the WhatsApp backend
//! in [`wa_bridge`]. This crate only maps HTTP requests onto them.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod qr;
#[cfg(test)]
pub(crate) mod test_helpers;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use channel_supervisor::ChannelSupervisor;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;
use wa_bridge::ExecutableResolver;

use crate::config::GatewayConfig;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: ChannelSupervisor,
    pub resolver: Arc<dyn ExecutableResolver>,
    pub config: Arc<GatewayConfig>,
    /// Client used to download media for `/sendMedia`
    pub http: reqwest::Client,
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/", get(handlers::health_handler))
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/channels", get(handlers::channels_handler))
        // Pairing
        .route("/connect", get(handlers::connect_handler).post(handlers::connect_handler))
        .route("/qr", get(handlers::qr_handler))
        .route("/qr.png", get(handlers::qr_png_handler))
        // Messaging
        .route("/send", post(handlers::send_handler))
        .route("/sendMedia", post(handlers::send_media_handler))
        // Session management
        .route(
            "/logout",
            get(handlers::reset_session_handler).post(handlers::reset_session_handler),
        )
        .route(
            "/session/reset",
            get(handlers::reset_session_handler).post(handlers::reset_session_handler),
        )
        .route("/debug/chrome", get(handlers::debug_chrome_handler))
        // Inline base64 media is a third larger than the file it carries
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::api_token_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use channel_supervisor::{ChannelId, ChannelStatus, ConnectionEvent};
    use tower::ServiceExt;

    use crate::test_helpers::{json_body, test_app_state, wait_for_status};

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (state, _connector, _tmp) = test_app_state();
        let resp = create_router(state).oneshot(get_req("/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_send_requires_post() {
        let (state, _connector, _tmp) = test_app_state();
        let resp = create_router(state).oneshot(get_req("/send")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_pair_then_send_flow() {
        let (state, connector, _tmp) = test_app_state();
        let app = create_router(state.clone());
        let id = ChannelId::from(3000);

        let resp = app.clone().oneshot(get_req("/connect")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        wait_for_status(&state, &id, ChannelStatus::Initializing).await;

        let conn = connector.latest().unwrap();
        conn.emit(ConnectionEvent::PairingCode("PAIR-1".into())).await;
        wait_for_status(&state, &id, ChannelStatus::AwaitingPairing).await;

        let json = json_body(app.clone().oneshot(get_req("/qr")).await.unwrap()).await;
        assert_eq!(json["qr"], "PAIR-1");

        conn.emit(ConnectionEvent::Authenticated).await;
        conn.emit(ConnectionEvent::Ready).await;
        wait_for_status(&state, &id, ChannelStatus::Connected).await;

        let req = Request::builder()
            .method("POST")
            .uri("/send")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"to":"15551234567","message":"hello"}"#))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(conn.sent().len(), 1);

        let json = json_body(app.oneshot(get_req("/status")).await.unwrap()).await;
        assert_eq!(json["connected"], true);
        assert_eq!(json["status"], "CONNECTED");
    }
}
