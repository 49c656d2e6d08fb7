use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::AppState;
use crate::error::ApiError;

pub const API_TOKEN_HEADER: &str = "x-api-token";

/// Token middleware for HTTP routes.
///
/// When an API token is configured, everything except the health routes
/// must present it as `Authorization: Bearer <token>` or `x-api-token: <token>`.
pub async fn api_token_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_token.as_deref() else {
        return next.run(request).await;
    };

    if is_public_route(request.uri().path()) {
        return next.run(request).await;
    }

    let token_present = presented_token(&request).is_some();
    let authorized = presented_token(&request)
        .is_some_and(|token| constant_time_eq(token.as_bytes(), expected.as_bytes()));
    if authorized {
        return next.run(request).await;
    }

    debug!(
        path = %request.uri().path(),
        token_present,
        "Rejected request without valid API token"
    );
    ApiError::Unauthorized.into_response()
}

fn is_public_route(path: &str) -> bool {
    path == "/" || path == "/health" || path == "/status"
}

fn presented_token(request: &Request) -> Option<&str> {
    let headers = request.headers();
    if let Some(bearer) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.trim());
    }
    headers
        .get(API_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
