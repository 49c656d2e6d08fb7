//! Line protocol spoken with the bridge process.
//!
//! Every line on the bridge's stdout is one JSON [`BridgeMessage`]; every
//! line we write to its stdin is one [`Envelope`] wrapping a
//! [`BridgeCommand`]. Replies carry the id of the command they answer.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use channel_supervisor::{ConnectionError, ConnectionEvent, OutgoingMessage};

/// Suffix the backend expects on individual chat ids.
const CHAT_SUFFIX: &str = "@c.us";

/// Anything the bridge prints on stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Qr {
        code: String,
    },
    Authenticated,
    Ready,
    AuthFailure {
        #[serde(default)]
        reason: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    State {
        state: String,
    },
    Reply(BridgeReply),
}

impl BridgeMessage {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// The supervisor event this message stands for. Replies are not events.
    pub fn into_event(self) -> Option<ConnectionEvent> {
        match self {
            BridgeMessage::Qr { code } => Some(ConnectionEvent::PairingCode(code)),
            BridgeMessage::Authenticated => Some(ConnectionEvent::Authenticated),
            BridgeMessage::Ready => Some(ConnectionEvent::Ready),
            BridgeMessage::AuthFailure { reason } => Some(ConnectionEvent::AuthFailure(reason)),
            BridgeMessage::Disconnected { reason } => Some(ConnectionEvent::Disconnected(reason)),
            BridgeMessage::State { state } => Some(ConnectionEvent::StateChanged(state)),
            BridgeMessage::Reply(_) => None,
        }
    }
}

/// Answer to a single command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeReply {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    /// Failure category: `launch`, `delivery` or anything else.
    #[serde(default)]
    pub kind: Option<String>,
}

impl BridgeReply {
    pub fn into_result(self) -> Result<Value, ConnectionError> {
        if self.ok {
            return Ok(self.result);
        }
        let message = self
            .error
            .unwrap_or_else(|| "bridge reported an unspecified error".to_string());
        Err(match self.kind.as_deref() {
            Some("launch") => ConnectionError::BrowserLaunch(message),
            Some("delivery") => ConnectionError::Delivery(message),
            _ => ConnectionError::Protocol(message),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BridgeCommand {
    /// Start the client, optionally pinning the browser executable.
    Init {
        executable_path: Option<String>,
    },
    State,
    Send {
        to: String,
        text: String,
    },
    SendMedia {
        to: String,
        mime_type: String,
        /// Base64 of the raw bytes
        data: String,
        filename: Option<String>,
        caption: Option<String>,
    },
    Logout,
    Destroy,
}

impl BridgeCommand {
    /// Build the delivery command for `message`, addressed to an already
    /// normalized chat id.
    pub fn deliver(to: String, message: &OutgoingMessage) -> Self {
        match message {
            OutgoingMessage::Text { body } => BridgeCommand::Send {
                to,
                text: body.clone(),
            },
            OutgoingMessage::Media {
                data,
                mime_type,
                filename,
                caption,
            } => BridgeCommand::SendMedia {
                to,
                mime_type: mime_type.clone(),
                data: STANDARD.encode(data),
                filename: filename.clone(),
                caption: caption.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BridgeCommand::Init { .. } => "init",
            BridgeCommand::State => "state",
            BridgeCommand::Send { .. } => "send",
            BridgeCommand::SendMedia { .. } => "sendMedia",
            BridgeCommand::Logout => "logout",
            BridgeCommand::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub command: &'a BridgeCommand,
}

impl Envelope<'_> {
    pub fn to_line(&self) -> Result<String, ConnectionError> {
        serde_json::to_string(self).map_err(|e| ConnectionError::Protocol(e.to_string()))
    }
}

/// Turn a user supplied recipient into a chat id.
///
/// Ids that already name a server (`...@c.us`, `...@g.us`) pass through.
/// Anything else is treated as a phone number: formatting characters are
/// dropped and the individual-chat suffix is appended. Returns `None` when
/// no digits are left.
pub fn normalize_recipient(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.contains('@') {
        return Some(raw.to_string());
    }
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("{}{}", digits, CHAT_SUFFIX))
    }
}
