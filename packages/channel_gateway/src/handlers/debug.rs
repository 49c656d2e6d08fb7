use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use super::timestamp;
use crate::AppState;

/// Where the gateway looks for a browser and what it found
pub async fn debug_chrome_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resolver = state.resolver.clone();
    let diagnostics = tokio::task::spawn_blocking(move || resolver.diagnostics()).await;

    match diagnostics {
        Ok(diagnostics) => Json(json!({
            "success": true,
            "resolver": diagnostics,
            "timestamp": timestamp(),
        })),
        Err(e) => Json(json!({
            "success": false,
            "error": format!("Resolver lookup failed: {}", e),
            "timestamp": timestamp(),
        })),
    }
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
    use tower::ServiceExt;

    use crate::test_helpers::{json_body, test_app_state};

    #[tokio::test]
    async fn test_debug_chrome_reports_search() {
        let (state, _connector, tmp) = test_app_state();
        let app = Router::new()
            .route("/debug/chrome", get(debug_chrome_handler))
            .with_state(state);

        let req = Request::builder()
            .uri("/debug/chrome")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = json_body(resp).await;
        assert_eq!(json["success"], true);
        let resolver = &json["resolver"];
        assert_eq!(
            resolver["cacheDir"],
            tmp.path().join("puppeteer").to_string_lossy().to_string()
        );
        let env = resolver["env"].as_array().unwrap();
        assert!(env.iter().any(|e| e["name"] == "CHROME_PATH" && e["value"].is_null()));
        assert!(resolver["checked"].is_array());
    }
}
