use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde_json::json;
use tracing::info;

use super::{ChannelQuery, timestamp};
use crate::AppState;
use crate::error::ApiError;

/// Log out, wipe the channel's stored session and start it again so a new
/// pairing code gets issued. Serves both `/logout` and `/session/reset`.
pub async fn reset_session_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let id = query.channel(&state)?;
    info!(channel = %id, "Session reset requested");
    state.supervisor.reset_session(&id).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Session for channel {} cleared, fetch /qr to pair again", id),
        "timestamp": timestamp(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        routing::get,
    };
    use channel_supervisor::{ChannelId, ChannelStatus};
    use tower::ServiceExt;

    use crate::test_helpers::{connect_channel, json_body, test_app_state, wait_for_status};

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/logout", get(reset_session_handler).post(reset_session_handler))
            .route(
                "/session/reset",
                get(reset_session_handler).post(reset_session_handler),
            )
            .with_state(state)
    }

    #[tokio::test]
    async fn test_reset_wipes_session_and_restarts() {
        let (state, connector, _tmp) = test_app_state();
        let id = ChannelId::from(3000);
        let first = connect_channel(&state, &connector, &id).await;

        let session_dir = state.supervisor.session_dir(&id);
        std::fs::create_dir_all(session_dir.join("Default")).unwrap();
        std::fs::write(session_dir.join("Default/creds.json"), "{}").unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/session/reset")
            .body(Body::empty())
            .unwrap();
        let resp = router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["success"], true);

        assert!(first.is_logged_out());
        assert!(first.is_destroyed());
        assert!(!session_dir.join("Default/creds.json").exists());
        assert_eq!(connector.opened_count(), 2);
        wait_for_status(&state, &id, ChannelStatus::Initializing).await;
    }

    #[tokio::test]
    async fn test_logout_on_unknown_channel_starts_it() {
        let (state, connector, _tmp) = test_app_state();
        let req = Request::builder()
            .uri("/logout?port=3005")
            .body(Body::empty())
            .unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(connector.opened_count(), 1);
        assert_eq!(
            connector.latest().unwrap().spec().channel,
            ChannelId::from(3005)
        );
    }
}
