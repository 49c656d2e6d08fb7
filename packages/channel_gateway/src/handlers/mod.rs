pub mod debug;
pub mod health;
pub mod messaging;
pub mod pairing;
pub mod session;

use channel_supervisor::ChannelId;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

// Re-export all handlers for easy route registration
pub use debug::debug_chrome_handler;
pub use health::{channels_handler, health_handler, status_handler};
pub use messaging::{send_handler, send_media_handler};
pub use pairing::{connect_handler, qr_handler, qr_png_handler};
pub use session::reset_session_handler;

/// `?port=<channel>` accepted by every route.
#[derive(Debug, Default, Deserialize)]
pub struct ChannelQuery {
    pub port: Option<String>,
}

impl ChannelQuery {
    /// The requested channel, or the gateway's own when none was given.
    pub fn channel(&self, state: &AppState) -> Result<ChannelId, ApiError> {
        match self.port.as_deref().map(str::trim) {
            None | Some("") => Ok(state.config.default_channel()),
            Some(raw) => ChannelId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string())),
        }
    }
}

pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
