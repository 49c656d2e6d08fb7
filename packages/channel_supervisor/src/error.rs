use std::path::PathBuf;
use std::time::Duration;

use crate::channel::ChannelId;

/// Failures reported by a connection backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// The messaging library could not be loaded at all
    #[error("failed to load messaging library: {0}")]
    LibraryLoad(String),
    /// The browser could not be started with any executable strategy
    #[error("failed to launch browser: {0}")]
    BrowserLaunch(String),
    /// The backend answered with something unexpected
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The backend refused or failed to deliver a message
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// The backend went away
    #[error("connection closed")]
    Closed,
    /// The backend did not answer in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by [`crate::ChannelSupervisor`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("channel {0} is not connected")]
    NotConnected(ChannelId),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("failed to open connection: {0}")]
    Connection(#[from] ConnectionError),
    #[error("failed to remove session directory {}: {source}", path.display())]
    SessionReset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
