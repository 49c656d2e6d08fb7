//! In-memory connection backend for exercising the supervisor without a
//! browser. Tests drive a channel by emitting events on the fake connection
//! the supervisor opened, and inspect what the supervisor did to it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::channel::ConnectionEvent;
use crate::connection::{
    Connection, ConnectionSpec, Connector, MessageId, OpenedConnection, OutgoingMessage,
};
use crate::error::ConnectionError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Shared {
    live: AtomicUsize,
    max_live: AtomicUsize,
    sent_total: AtomicUsize,
    opened: Mutex<Vec<Arc<FakeConnection>>>,
    open_error: Mutex<Option<ConnectionError>>,
    init_error: Mutex<Option<ConnectionError>>,
}

/// Connector handing out [`FakeConnection`]s and counting how many are alive.
#[derive(Clone, Default)]
pub struct FakeConnector {
    shared: Arc<Shared>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `open` calls fail (or succeed again with `None`).
    pub fn fail_open_with(&self, error: Option<ConnectionError>) {
        *lock(&self.shared.open_error) = error;
    }

    /// Make `initialize` fail on connections opened from now on.
    pub fn fail_initialize_with(&self, error: Option<ConnectionError>) {
        *lock(&self.shared.init_error) = error;
    }

    pub fn opened_count(&self) -> usize {
        lock(&self.shared.opened).len()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<FakeConnection>> {
        lock(&self.shared.opened).get(index).cloned()
    }

    pub fn latest(&self) -> Option<Arc<FakeConnection>> {
        lock(&self.shared.opened).last().cloned()
    }

    /// Connections opened and not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live connections ever observed.
    pub fn max_live(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    /// Messages delivered across every connection.
    pub fn sent_total(&self) -> usize {
        self.shared.sent_total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, spec: ConnectionSpec) -> Result<OpenedConnection, ConnectionError> {
        if let Some(error) = lock(&self.shared.open_error).clone() {
            return Err(error);
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let connection = Arc::new(FakeConnection {
            spec,
            events: events_tx,
            sent: Mutex::new(Vec::new()),
            live_state: Mutex::new("CONNECTED".to_string()),
            send_error: Mutex::new(None),
            init_error: lock(&self.shared.init_error).clone(),
            destroyed: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
            shared: self.shared.clone(),
        });

        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);
        lock(&self.shared.opened).push(connection.clone());

        Ok(OpenedConnection {
            connection,
            events: events_rx,
        })
    }
}

/// A scripted connection. Nothing happens unless the test emits events.
pub struct FakeConnection {
    spec: ConnectionSpec,
    events: mpsc::Sender<ConnectionEvent>,
    sent: Mutex<Vec<(String, OutgoingMessage)>>,
    live_state: Mutex<String>,
    send_error: Mutex<Option<ConnectionError>>,
    init_error: Option<ConnectionError>,
    destroyed: AtomicBool,
    logged_out: AtomicBool,
    shared: Arc<Shared>,
}

impl FakeConnection {
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    /// Push an event to the supervisor. Ignored once the supervisor stopped listening.
    pub async fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event).await;
    }

    pub fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        lock(&self.sent).clone()
    }

    pub fn set_live_state(&self, state: &str) {
        *lock(&self.live_state) = state.to_string();
    }

    pub fn fail_sends_with(&self, error: Option<ConnectionError>) {
        *lock(&self.send_error) = error;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn initialize(&self) -> Result<(), ConnectionError> {
        match &self.init_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn state(&self) -> Result<String, ConnectionError> {
        if self.is_destroyed() {
            return Err(ConnectionError::Closed);
        }
        Ok(lock(&self.live_state).clone())
    }

    async fn send(
        &self,
        recipient: &str,
        message: &OutgoingMessage,
    ) -> Result<MessageId, ConnectionError> {
        if self.is_destroyed() {
            return Err(ConnectionError::Closed);
        }
        if let Some(error) = lock(&self.send_error).clone() {
            return Err(error);
        }
        let mut sent = lock(&self.sent);
        sent.push((recipient.to_string(), message.clone()));
        self.shared.sent_total.fetch_add(1, Ordering::SeqCst);
        Ok(MessageId(format!(
            "fake-{}-{}",
            self.spec.channel,
            sent.len()
        )))
    }

    async fn logout(&self) -> Result<(), ConnectionError> {
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
