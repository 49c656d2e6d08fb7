use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channel::{ChannelId, ConnectionEvent};
use crate::error::ConnectionError;

/// Delivery acknowledgement returned by the backend for a sent message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload to deliver to a recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutgoingMessage {
    Text {
        body: String,
    },
    Media {
        data: Vec<u8>,
        mime_type: String,
        filename: Option<String>,
        caption: Option<String>,
    },
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        OutgoingMessage::Text { body: body.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::Text { .. } => "text",
            OutgoingMessage::Media { .. } => "media",
        }
    }
}

/// Everything a backend needs to open a channel's connection.
#[derive(Clone, Debug)]
pub struct ConnectionSpec {
    pub channel: ChannelId,
    /// Directory holding the channel's persisted session credentials.
    pub session_dir: PathBuf,
}

/// A freshly opened connection plus the stream of events it will emit.
pub struct OpenedConnection {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// One live, stateful connection to the messaging backend.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Start the connection. May take a long time; progress is reported
    /// through the event stream rather than the return value.
    async fn initialize(&self) -> Result<(), ConnectionError>;

    /// Ask the backend for its current raw state string.
    async fn state(&self) -> Result<String, ConnectionError>;

    async fn send(
        &self,
        recipient: &str,
        message: &OutgoingMessage,
    ) -> Result<MessageId, ConnectionError>;

    /// Invalidate the paired session on the backend side.
    async fn logout(&self) -> Result<(), ConnectionError>;

    /// Tear the connection down. Must be idempotent.
    async fn destroy(&self);
}

/// Factory for connections, one call per channel start.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, spec: ConnectionSpec) -> Result<OpenedConnection, ConnectionError>;
}
