use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::channel::{
    ChannelId, ChannelSnapshot, ChannelState, ChannelStatus, ConnectionEvent, Transition,
};
use crate::connection::{Connection, ConnectionSpec, Connector, MessageId, OutgoingMessage};
use crate::error::SupervisorError;

/// Tunables for a [`ChannelSupervisor`].
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Parent directory of every channel's `session-<id>` directory.
    pub sessions_root: PathBuf,
    pub backoff: BackoffPolicy,
    /// Interval between checks while waiting for a pairing code.
    pub poll_interval: Duration,
    /// Upper bound on a live status query before the cached value is used.
    pub status_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sessions_root: PathBuf::from(".wwebjs_auth"),
            backoff: BackoffPolicy::default(),
            poll_interval: Duration::from_millis(500),
            status_timeout: Duration::from_secs(3),
        }
    }
}

/// Notifications about channel transitions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    StatusChanged {
        channel: ChannelId,
        status: ChannelStatus,
    },
    RetryScheduled {
        channel: ChannelId,
        attempt: u32,
        delay: Duration,
    },
    RetriesExhausted {
        channel: ChannelId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LaunchReason {
    /// Requested by a caller; restores the retry budget.
    Explicit,
    /// Scheduled by the backoff policy; only valid for the generation it was scheduled in.
    Retry { generation: u64 },
}

/// Internal state for a supervised channel
struct ChannelSlot {
    state: ChannelState,
    connection: Option<Arc<dyn Connection>>,
    /// Bumped on every launch and teardown. Events, initializers and retries
    /// carry the generation they belong to and are dropped once it is stale.
    generation: u64,
}

struct Inner {
    channels: RwLock<HashMap<ChannelId, ChannelSlot>>,
    connector: Arc<dyn Connector>,
    config: SupervisorConfig,
    next_generation: AtomicU64,
    event_tx: broadcast::Sender<SupervisorEvent>,
}

/// Owns every channel and its connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChannelSupervisor {
    inner: Arc<Inner>,
}

impl ChannelSupervisor {
    pub fn new(connector: Arc<dyn Connector>, config: SupervisorConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                channels: RwLock::new(HashMap::new()),
                connector,
                config,
                next_generation: AtomicU64::new(1),
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Directory holding the persisted session of `id`.
    pub fn session_dir(&self, id: &ChannelId) -> PathBuf {
        self.inner
            .config
            .sessions_root
            .join(format!("session-{}", id))
    }

    /// Subscribe to transitions of all channels
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.event_tx.subscribe()
    }

    fn fresh_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    /// Start a channel's connection without waiting for it to come up.
    ///
    /// Does nothing if the channel is already initializing, awaiting pairing
    /// or connected. Otherwise any stale connection is torn down and a fresh
    /// one is opened against the channel's session directory.
    pub async fn start_channel(&self, id: &ChannelId) -> Result<(), SupervisorError> {
        self.launch(id, LaunchReason::Explicit).await
    }

    async fn launch(&self, id: &ChannelId, reason: LaunchReason) -> Result<(), SupervisorError> {
        let generation = self.fresh_generation();

        let stale = {
            let mut channels = self.inner.channels.write().await;
            let slot = channels.entry(id.clone()).or_insert_with(|| ChannelSlot {
                state: ChannelState::new(id.clone()),
                connection: None,
                generation: 0,
            });

            if let LaunchReason::Retry {
                generation: scheduled,
            } = reason
            {
                if slot.generation != scheduled {
                    debug!(channel = %id, "Scheduled reconnect superseded, skipping");
                    return Ok(());
                }
            }

            if slot.state.status().is_active() {
                debug!(channel = %id, status = %slot.state.status(), "Channel already active");
                return Ok(());
            }

            slot.generation = generation;
            slot.state.mark_initializing(reason == LaunchReason::Explicit);
            slot.connection.take()
        };

        info!(channel = %id, ?reason, "Starting channel connection");
        self.emit(SupervisorEvent::StatusChanged {
            channel: id.clone(),
            status: ChannelStatus::Initializing,
        });

        if let Some(stale) = stale {
            debug!(channel = %id, "Destroying stale connection");
            stale.destroy().await;
        }

        let spec = ConnectionSpec {
            channel: id.clone(),
            session_dir: self.session_dir(id),
        };

        let opened = match self.inner.connector.open(spec).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(channel = %id, "Failed to open connection: {}", e);
                self.handle_event(
                    id,
                    generation,
                    ConnectionEvent::Disconnected(format!("open failed: {}", e)),
                )
                .await;
                return Err(e.into());
            }
        };

        let connection = opened.connection;
        let installed = {
            let mut channels = self.inner.channels.write().await;
            match channels.get_mut(id) {
                Some(slot) if slot.generation == generation => {
                    slot.connection = Some(connection.clone());
                    true
                }
                _ => false,
            }
        };

        if !installed {
            debug!(channel = %id, "Channel was stopped while opening, discarding connection");
            connection.destroy().await;
            return Ok(());
        }

        self.spawn_event_pump(id.clone(), generation, opened.events);
        self.spawn_initializer(id.clone(), generation, connection);
        Ok(())
    }

    fn spawn_event_pump(
        &self,
        id: ChannelId,
        generation: u64,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !supervisor.handle_event(&id, generation, event).await {
                    break;
                }
            }
            debug!(channel = %id, generation, "Event pump finished");
        });
    }

    fn spawn_initializer(&self, id: ChannelId, generation: u64, connection: Arc<dyn Connection>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.initialize().await {
                warn!(channel = %id, "Connection initialization failed: {}", e);
                supervisor
                    .handle_event(
                        &id,
                        generation,
                        ConnectionEvent::Disconnected(format!("initialization failed: {}", e)),
                    )
                    .await;
            }
        });
    }

    /// Apply an event from connection `generation`. Returns false once that
    /// connection is gone and its events should no longer be consumed.
    async fn handle_event(&self, id: &ChannelId, generation: u64, event: ConnectionEvent) -> bool {
        let (before, after, transition, retry_generation, torn_down) = {
            let mut channels = self.inner.channels.write().await;
            let Some(slot) = channels.get_mut(id) else {
                return false;
            };
            if slot.generation != generation {
                debug!(channel = %id, ?event, "Dropping event from stale connection");
                return false;
            }

            let before = slot.state.status();
            let transition = slot.state.apply(&event, &self.inner.config.backoff);
            let after = slot.state.status();

            let torn_down = if transition.tears_down() {
                slot.generation = self.fresh_generation();
                slot.connection.take()
            } else {
                None
            };
            (before, after, transition, slot.generation, torn_down)
        };

        if before != after {
            info!(channel = %id, from = %before, to = %after, "Channel status changed");
            self.emit(SupervisorEvent::StatusChanged {
                channel: id.clone(),
                status: after,
            });
        }

        if let Some(connection) = torn_down {
            connection.destroy().await;
        }

        match transition {
            Transition::None => true,
            Transition::Retry { delay, attempt } => {
                info!(channel = %id, attempt, ?delay, "Scheduling reconnect");
                self.emit(SupervisorEvent::RetryScheduled {
                    channel: id.clone(),
                    attempt,
                    delay,
                });
                self.schedule_retry(id.clone(), retry_generation, delay);
                false
            }
            Transition::GiveUp => {
                warn!(
                    channel = %id,
                    max_retries = self.inner.config.backoff.max_retries,
                    "Reconnect attempts exhausted, waiting for explicit restart"
                );
                self.emit(SupervisorEvent::RetriesExhausted {
                    channel: id.clone(),
                });
                false
            }
            Transition::Terminal => {
                warn!(channel = %id, "Authentication failed, session reset required");
                false
            }
        }
    }

    fn schedule_retry(&self, id: ChannelId, generation: u64, delay: Duration) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = supervisor
                .launch(&id, LaunchReason::Retry { generation })
                .await
            {
                warn!(channel = %id, "Reconnect attempt failed: {}", e);
            }
        });
    }

    /// Cached status of a channel. Unknown channels report as uninitialized
    /// without being registered; only starting a channel adds it to [`list`](Self::list).
    pub async fn status(&self, id: &ChannelId) -> ChannelSnapshot {
        match self.inner.channels.read().await.get(id) {
            Some(slot) => slot.state.snapshot(),
            None => ChannelState::new(id.clone()).snapshot(),
        }
    }

    /// Like [`status`](Self::status), but first asks the live connection for
    /// its raw state. Failures and timeouts fall back to the cached value.
    pub async fn refresh_status(&self, id: &ChannelId) -> ChannelSnapshot {
        let live = {
            let channels = self.inner.channels.read().await;
            channels
                .get(id)
                .and_then(|slot| slot.connection.clone().map(|c| (c, slot.generation)))
        };

        if let Some((connection, generation)) = live {
            match tokio::time::timeout(self.inner.config.status_timeout, connection.state()).await
            {
                Ok(Ok(state)) => {
                    let mut channels = self.inner.channels.write().await;
                    if let Some(slot) = channels.get_mut(id) {
                        if slot.generation == generation {
                            slot.state.record_live_state(state);
                        }
                    }
                }
                Ok(Err(e)) => debug!(channel = %id, "Live state query failed: {}", e),
                Err(_) => debug!(channel = %id, "Live state query timed out"),
            }
        }

        self.status(id).await
    }

    /// Deliver a message through a connected channel.
    pub async fn send_message(
        &self,
        id: &ChannelId,
        recipient: &str,
        message: &OutgoingMessage,
    ) -> Result<MessageId, SupervisorError> {
        let connection = {
            let channels = self.inner.channels.read().await;
            channels
                .get(id)
                .filter(|slot| slot.state.status() == ChannelStatus::Connected)
                .and_then(|slot| slot.connection.clone())
        }
        .ok_or_else(|| SupervisorError::NotConnected(id.clone()))?;

        debug!(channel = %id, kind = message.kind(), "Sending message");
        connection
            .send(recipient, message)
            .await
            .map_err(|e| SupervisorError::Delivery(e.to_string()))
    }

    /// Poll until the channel has a pairing code or `timeout` elapses.
    ///
    /// Returns `None` if no code showed up in time or the channel connected
    /// without needing one.
    pub async fn wait_for_pairing_artifact(
        &self,
        id: &ChannelId,
        timeout: Duration,
    ) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.status(id).await;
            if snapshot.pairing_artifact.is_some() {
                return snapshot.pairing_artifact;
            }
            if snapshot.connected {
                return None;
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.inner.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Tear down a channel's connection and cancel any pending reconnect.
    /// Returns false if the channel was never seen.
    pub async fn stop_channel(&self, id: &ChannelId) -> bool {
        let connection = {
            let mut channels = self.inner.channels.write().await;
            let Some(slot) = channels.get_mut(id) else {
                return false;
            };
            slot.generation = self.fresh_generation();
            slot.state.mark_stopped();
            slot.connection.take()
        };

        info!(channel = %id, "Channel stopped");
        self.emit(SupervisorEvent::StatusChanged {
            channel: id.clone(),
            status: ChannelStatus::Disconnected,
        });

        if let Some(connection) = connection {
            connection.destroy().await;
        }
        true
    }

    /// Discard a channel's persisted identity and start it from scratch.
    pub async fn reset_session(&self, id: &ChannelId) -> Result<(), SupervisorError> {
        let connection = {
            let channels = self.inner.channels.read().await;
            channels.get(id).and_then(|slot| slot.connection.clone())
        };
        if let Some(connection) = connection {
            if let Err(e) = connection.logout().await {
                warn!(channel = %id, "Logout before reset failed: {}", e);
            }
        }

        self.stop_channel(id).await;

        let dir = self.session_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!(channel = %id, "Removed session directory {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(SupervisorError::SessionReset { path: dir, source }),
        }

        {
            let mut channels = self.inner.channels.write().await;
            if let Some(slot) = channels.get_mut(id) {
                slot.state.reset();
            }
        }

        self.start_channel(id).await
    }

    /// Snapshots of every known channel, ordered by id.
    pub async fn list(&self) -> Vec<ChannelSnapshot> {
        let channels = self.inner.channels.read().await;
        let mut list: Vec<ChannelSnapshot> =
            channels.values().map(|slot| slot.state.snapshot()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Destroy every live connection. Used on process shutdown.
    pub async fn shutdown(&self) {
        let connections: Vec<(ChannelId, Arc<dyn Connection>)> = {
            let mut channels = self.inner.channels.write().await;
            channels
                .iter_mut()
                .filter_map(|(id, slot)| {
                    slot.generation = self.fresh_generation();
                    slot.state.mark_stopped();
                    slot.connection.take().map(|c| (id.clone(), c))
                })
                .collect()
        };

        for (id, connection) in connections {
            debug!(channel = %id, "Destroying connection on shutdown");
            connection.destroy().await;
        }
    }
}
