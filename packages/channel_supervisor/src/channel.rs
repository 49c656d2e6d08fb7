use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

const MAX_CHANNEL_ID_LEN: usize = 64;

/// Identifier of a channel. Historically the TCP port a front-end listened
/// on; really just a label that also names the channel's session directory.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid channel id {0:?}: expected 1-64 characters of [A-Za-z0-9_-]")]
pub struct InvalidChannelId(pub String);

impl ChannelId {
    /// Parse a channel id, rejecting anything that is unsafe as a path component.
    pub fn parse(raw: &str) -> Result<Self, InvalidChannelId> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_CHANNEL_ID_LEN
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(InvalidChannelId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u16> for ChannelId {
    fn from(port: u16) -> Self {
        Self(port.to_string())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last known status of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Uninitialized,
    Initializing,
    AwaitingPairing,
    Connected,
    Disconnected,
    AuthFailed,
}

impl ChannelStatus {
    /// A channel in one of these states owns (or is opening) a connection.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ChannelStatus::Initializing | ChannelStatus::AwaitingPairing | ChannelStatus::Connected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Uninitialized => "UNINITIALIZED",
            ChannelStatus::Initializing => "INITIALIZING",
            ChannelStatus::AwaitingPairing => "AWAITING_PAIRING",
            ChannelStatus::Connected => "CONNECTED",
            ChannelStatus::Disconnected => "DISCONNECTED",
            ChannelStatus::AuthFailed => "AUTH_FAILED",
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by a live connection, one at a time and in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A pairing code is ready to be scanned.
    PairingCode(String),
    /// Credentials were accepted; the session is still loading.
    Authenticated,
    /// The session is fully usable.
    Ready,
    /// The connection reported a new raw state string.
    StateChanged(String),
    /// The connection dropped.
    Disconnected(String),
    /// Persisted credentials were rejected.
    AuthFailure(String),
}

/// Follow-up work the supervisor must perform after applying an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Nothing beyond the state update.
    None,
    /// Tear the connection down and reconnect after `delay`.
    Retry { delay: Duration, attempt: u32 },
    /// Tear the connection down; the retry budget is spent.
    GiveUp,
    /// Tear the connection down; the failure needs operator intervention.
    Terminal,
}

impl Transition {
    pub fn tears_down(&self) -> bool {
        !matches!(self, Transition::None)
    }
}

/// Mutable per-channel state. All mutation goes through methods so that a
/// pairing code can only be present while the channel awaits pairing.
#[derive(Clone, Debug)]
pub struct ChannelState {
    id: ChannelId,
    status: ChannelStatus,
    pairing_artifact: Option<String>,
    retry_count: u32,
    last_error: Option<String>,
    live_state: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl ChannelState {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            status: ChannelStatus::Uninitialized,
            pairing_artifact: None,
            retry_count: 0,
            last_error: None,
            live_state: None,
            next_retry_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn pairing_artifact(&self) -> Option<&str> {
        self.pairing_artifact.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn set_status(&mut self, status: ChannelStatus) {
        self.status = status;
        if status != ChannelStatus::AwaitingPairing {
            self.pairing_artifact = None;
        }
        self.updated_at = Utc::now();
    }

    /// Apply one connection event and report what the supervisor must do next.
    pub fn apply(&mut self, event: &ConnectionEvent, policy: &BackoffPolicy) -> Transition {
        match event {
            ConnectionEvent::PairingCode(code) => {
                self.set_status(ChannelStatus::AwaitingPairing);
                self.pairing_artifact = Some(code.clone());
                Transition::None
            }
            ConnectionEvent::Authenticated => {
                if self.status == ChannelStatus::AwaitingPairing {
                    self.set_status(ChannelStatus::Initializing);
                }
                Transition::None
            }
            ConnectionEvent::Ready => {
                self.set_status(ChannelStatus::Connected);
                self.retry_count = 0;
                self.last_error = None;
                self.next_retry_at = None;
                Transition::None
            }
            ConnectionEvent::StateChanged(state) => {
                self.record_live_state(state.clone());
                Transition::None
            }
            ConnectionEvent::Disconnected(reason) => {
                self.set_status(ChannelStatus::Disconnected);
                self.last_error = Some(reason.clone());
                if policy.allows(self.retry_count) {
                    let delay = policy.delay_for(self.retry_count);
                    self.retry_count += 1;
                    self.next_retry_at = TimeDelta::from_std(delay).ok().map(|d| Utc::now() + d);
                    Transition::Retry {
                        delay,
                        attempt: self.retry_count,
                    }
                } else {
                    self.next_retry_at = None;
                    Transition::GiveUp
                }
            }
            ConnectionEvent::AuthFailure(reason) => {
                self.set_status(ChannelStatus::AuthFailed);
                self.last_error = Some(reason.clone());
                self.next_retry_at = None;
                Transition::Terminal
            }
        }
    }

    pub(crate) fn record_live_state(&mut self, state: String) {
        self.live_state = Some(state);
        self.updated_at = Utc::now();
    }

    /// A new connection is being opened. Explicit starts restore the retry budget.
    pub(crate) fn mark_initializing(&mut self, reset_retries: bool) {
        self.set_status(ChannelStatus::Initializing);
        self.next_retry_at = None;
        self.live_state = None;
        if reset_retries {
            self.retry_count = 0;
        }
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.set_status(ChannelStatus::Disconnected);
        self.next_retry_at = None;
    }

    /// Forget everything learned about the previous session.
    pub(crate) fn reset(&mut self) {
        self.set_status(ChannelStatus::Uninitialized);
        self.retry_count = 0;
        self.last_error = None;
        self.live_state = None;
        self.next_retry_at = None;
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            id: self.id.clone(),
            status: self.status,
            connected: self.status == ChannelStatus::Connected,
            pairing_artifact: self.pairing_artifact.clone(),
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            live_state: self.live_state.clone(),
            next_retry_at: self.next_retry_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of a channel handed out to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub status: ChannelStatus,
    pub connected: bool,
    pub pairing_artifact: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub live_state: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
