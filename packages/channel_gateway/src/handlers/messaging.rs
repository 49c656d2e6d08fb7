use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use channel_supervisor::{ChannelId, OutgoingMessage};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{ChannelQuery, timestamp};
use crate::AppState;
use crate::error::ApiError;

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Alias of `message`
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMediaRequest {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub media_url: Option<String>,
    /// Raw base64 or a `data:<mime>;base64,<payload>` URL
    #[serde(default)]
    pub media_base64: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    let message = format!("Invalid request body: {}", rejection.body_text());
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(message)
    } else {
        ApiError::BadRequest(message)
    }
}

/// Refuse early so no media is downloaded for a channel that cannot send it.
async fn require_connected(state: &AppState, id: &ChannelId) -> Result<(), ApiError> {
    if state.supervisor.status(id).await.connected {
        Ok(())
    } else {
        Err(ApiError::NotConnected)
    }
}

pub async fn send_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let id = query.channel(&state)?;
    let Json(req) = body.map_err(bad_body)?;

    let to = req.to.trim().to_string();
    let text = non_empty(req.message).or_else(|| non_empty(req.text));
    let (false, Some(text)) = (to.is_empty(), text) else {
        return Err(ApiError::BadRequest(
            "Both 'to' and 'message' are required".to_string(),
        ));
    };

    let message_id = state
        .supervisor
        .send_message(&id, &to, &OutgoingMessage::text(text))
        .await?;
    info!(channel = %id, to = %to, message_id = %message_id, "Message sent");

    Ok(Json(json!({
        "success": true,
        "message": "Message sent",
        "to": to,
        "messageId": message_id,
        "timestamp": timestamp(),
    })))
}

pub async fn send_media_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
    body: Result<Json<SendMediaRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let id = query.channel(&state)?;
    let Json(req) = body.map_err(bad_body)?;

    let to = req.to.trim().to_string();
    if to.is_empty() {
        return Err(ApiError::BadRequest("'to' is required".to_string()));
    }
    require_connected(&state, &id).await?;

    let media = match (non_empty(req.media_base64), non_empty(req.media_url)) {
        (Some(encoded), _) => decode_inline(&encoded)?,
        (None, Some(url)) => fetch_media(&state.http, &url, state.config.max_body_bytes).await?,
        (None, None) => {
            return Err(ApiError::BadRequest(
                "Either 'mediaUrl' or 'mediaBase64' is required".to_string(),
            ));
        }
    };

    let filename = non_empty(req.filename).or(media.filename);
    let mime_type = non_empty(req.mime_type)
        .or(media.mime_type)
        .or_else(|| {
            filename
                .as_deref()
                .and_then(|name| mime_guess::from_path(name).first())
                .map(|mime| mime.essence_str().to_string())
        })
        .unwrap_or_else(|| FALLBACK_MIME.to_string());
    debug!(channel = %id, bytes = media.data.len(), mime = %mime_type, "Sending media");

    let message = OutgoingMessage::Media {
        data: media.data,
        mime_type,
        filename,
        caption: non_empty(req.caption),
    };
    let message_id = state.supervisor.send_message(&id, &to, &message).await?;
    info!(channel = %id, to = %to, message_id = %message_id, "Media sent");

    Ok(Json(json!({
        "success": true,
        "to": to,
        "messageId": message_id,
        "timestamp": timestamp(),
    })))
}

/// Media bytes plus whatever their source said about them.
struct Media {
    data: Vec<u8>,
    mime_type: Option<String>,
    filename: Option<String>,
}

/// Split `data:image/png;base64,AAAA` into its mime type and payload.
/// Plain base64 comes back unchanged with no mime type.
fn split_data_url(value: &str) -> (Option<&str>, &str) {
    let Some(rest) = value.strip_prefix("data:") else {
        return (None, value);
    };
    match rest.split_once(',') {
        Some((meta, payload)) => {
            let mime = meta.split(';').next().filter(|m| !m.is_empty());
            (mime, payload)
        }
        None => (None, value),
    }
}

fn decode_inline(value: &str) -> Result<Media, ApiError> {
    let (mime, payload) = split_data_url(value.trim());
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let data = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("Invalid base64 media: {}", e)))?;
    Ok(Media {
        data,
        mime_type: mime.map(str::to_string),
        filename: None,
    })
}

/// Download `url`, refusing anything larger than `limit` bytes.
async fn fetch_media(
    client: &reqwest::Client,
    url: &str,
    limit: usize,
) -> Result<Media, ApiError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ApiError::BadRequest(format!("Invalid mediaUrl: {}", e)))?;
    debug!(url = %parsed, "Fetching media");

    let mut response = client
        .get(parsed.clone())
        .send()
        .await
        .map_err(|e| ApiError::MediaFetch(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ApiError::MediaFetch(format!(
            "{} returned {}",
            parsed,
            response.status()
        )));
    }

    let mime_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != FALLBACK_MIME);
    let filename = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let too_large = || ApiError::MediaFetch(format!("{} is larger than {} bytes", parsed, limit));
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut data = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ApiError::MediaFetch(e.to_string()))?
    {
        if data.len() + chunk.len() > limit {
            return Err(too_large());
        }
        data.extend_from_slice(&chunk);
    }

    Ok(Media {
        data,
        mime_type,
        filename,
    })
}
