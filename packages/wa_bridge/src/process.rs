//! A bridge child process wrapped as a [`Connection`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use channel_supervisor::{
    ChannelId, Connection, ConnectionError, ConnectionEvent, ConnectionSpec, MessageId,
    OutgoingMessage,
};

use crate::connector::BridgeSettings;
use crate::protocol::{BridgeCommand, BridgeMessage, Envelope, normalize_recipient};

/// Event buffer between the stdout reader and the supervisor.
const EVENT_BUFFER: usize = 64;

/// Grace period for the bridge to close the browser before it is killed.
const DESTROY_GRACE: Duration = Duration::from_secs(5);

type ReplySender = oneshot::Sender<Result<Value, ConnectionError>>;
type PendingMap = HashMap<u64, ReplySender>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the connection handle and its IO tasks.
struct Shared {
    channel: ChannelId,
    pending: Mutex<PendingMap>,
    closed: AtomicBool,
}

impl Shared {
    /// Mark the process gone and fail every outstanding request.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<ReplySender> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            debug!(
                channel = %self.channel,
                count = pending.len(),
                "Failing pending bridge requests"
            );
        }
        for tx in pending {
            let _ = tx.send(Err(ConnectionError::Closed));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct BridgeConnection {
    shared: Arc<Shared>,
    stdin_tx: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    child: tokio::sync::Mutex<Option<Child>>,
    /// Browser executables to try on `initialize`, best first.
    executables: Vec<PathBuf>,
    command_timeout: Duration,
    init_timeout: Duration,
}

impl BridgeConnection {
    /// Spawn the bridge for `spec` and wire up its stdio.
    pub fn spawn(
        settings: &BridgeSettings,
        spec: &ConnectionSpec,
        executables: Vec<PathBuf>,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>), ConnectionError> {
        let mut child = Command::new(&settings.runtime)
            .arg(&settings.script)
            .arg("--client-id")
            .arg(spec.channel.as_str())
            .arg("--session-dir")
            .arg(&spec.session_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConnectionError::LibraryLoad(format!(
                    "failed to spawn {} {}: {}",
                    settings.runtime.display(),
                    settings.script.display(),
                    e
                ))
            })?;

        let missing = || ConnectionError::Protocol("bridge stdio not captured".to_string());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        info!(
            channel = %spec.channel,
            pid = ?child.id(),
            session_dir = %spec.session_dir.display(),
            "Spawned bridge process"
        );

        let shared = Arc::new(Shared {
            channel: spec.channel.clone(),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(write_stdin(spec.channel.clone(), stdin, stdin_rx));
        tokio::spawn(read_stdout(shared.clone(), stdout, events_tx));

        let channel = spec.channel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(channel = %channel, "bridge: {}", line);
            }
        });

        let connection = Self {
            shared,
            stdin_tx,
            next_id: AtomicU64::new(1),
            child: tokio::sync::Mutex::new(Some(child)),
            executables,
            command_timeout: settings.command_timeout,
            init_timeout: settings.init_timeout,
        };
        Ok((connection, events_rx))
    }

    /// Send one command and wait for its reply.
    async fn request(
        &self,
        command: &BridgeCommand,
        timeout: Duration,
    ) -> Result<Value, ConnectionError> {
        if self.shared.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = Envelope { id, command }.to_line()?;

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);
        // The reader may have drained the map between the check above and the insert
        if self.shared.is_closed() {
            lock(&self.shared.pending).remove(&id);
            return Err(ConnectionError::Closed);
        }

        trace!(channel = %self.shared.channel, id, cmd = command.name(), "Bridge request");
        if self.stdin_tx.send(line).is_err() {
            lock(&self.shared.pending).remove(&id);
            return Err(ConnectionError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                warn!(
                    channel = %self.shared.channel,
                    id,
                    cmd = command.name(),
                    "Bridge request timed out"
                );
                Err(ConnectionError::Timeout(timeout))
            }
        }
    }
}

async fn write_stdin(
    channel: ChannelId,
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(channel = %channel, "Bridge stdin closed: {}", e);
            break;
        }
    }
}

async fn read_stdout(
    shared: Arc<Shared>,
    stdout: ChildStdout,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let channel = shared.channel.clone();
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(channel = %channel, "Failed to read bridge output: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match BridgeMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(channel = %channel, "Ignoring unrecognized bridge output ({}): {}", e, line);
                continue;
            }
        };

        match message {
            BridgeMessage::Reply(reply) => {
                let id = reply.id;
                match lock(&shared.pending).remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(reply.into_result());
                    }
                    None => debug!(channel = %channel, id, "Reply for unknown request"),
                }
            }
            other => {
                if let Some(event) = other.into_event() {
                    trace!(channel = %channel, ?event, "Bridge event");
                    // The receiver is gone once the supervisor moved on from this process
                    let _ = events.send(event).await;
                }
            }
        }
    }

    info!(channel = %channel, "Bridge process output closed");
    shared.close();
    let _ = events
        .send(ConnectionEvent::Disconnected(
            "bridge process exited".to_string(),
        ))
        .await;
}

#[async_trait]
impl Connection for BridgeConnection {
    /// Start the client, walking the executable candidates until one launches.
    /// The bridge's own resolution is the last resort.
    async fn initialize(&self) -> Result<(), ConnectionError> {
        let attempts = self
            .executables
            .iter()
            .map(|path| Some(path.display().to_string()))
            .chain(std::iter::once(None));

        let mut failures = Vec::new();
        for executable_path in attempts {
            let label = executable_path
                .clone()
                .unwrap_or_else(|| "<auto>".to_string());
            debug!(channel = %self.shared.channel, executable = %label, "Initializing client");

            let command = BridgeCommand::Init { executable_path };
            match self.request(&command, self.init_timeout).await {
                Ok(_) => {
                    info!(
                        channel = %self.shared.channel,
                        executable = %label,
                        "Client initialized"
                    );
                    return Ok(());
                }
                Err(ConnectionError::BrowserLaunch(reason)) => {
                    warn!(
                        channel = %self.shared.channel,
                        executable = %label,
                        "Browser launch failed: {}",
                        reason
                    );
                    failures.push(format!("{}: {}", label, reason));
                }
                Err(e) => return Err(e),
            }
        }

        Err(ConnectionError::BrowserLaunch(format!(
            "no executable could be launched ({})",
            failures.join("; ")
        )))
    }

    async fn state(&self) -> Result<String, ConnectionError> {
        let value = self.request(&BridgeCommand::State, self.command_timeout).await?;
        Ok(match value {
            Value::String(state) => state,
            Value::Null => "UNKNOWN".to_string(),
            other => other.to_string(),
        })
    }

    async fn send(
        &self,
        recipient: &str,
        message: &OutgoingMessage,
    ) -> Result<MessageId, ConnectionError> {
        let to = normalize_recipient(recipient).ok_or_else(|| {
            ConnectionError::Delivery(format!("invalid recipient {:?}", recipient))
        })?;
        let command = BridgeCommand::deliver(to, message);
        let value = self.request(&command, self.command_timeout).await?;

        let id = match &value {
            Value::String(id) => Some(id.clone()),
            Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        id.map(MessageId).ok_or_else(|| {
            ConnectionError::Protocol(format!("reply without message id: {}", value))
        })
    }

    async fn logout(&self) -> Result<(), ConnectionError> {
        self.request(&BridgeCommand::Logout, self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn destroy(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if !self.shared.is_closed() {
            if let Err(e) = self.request(&BridgeCommand::Destroy, DESTROY_GRACE).await {
                debug!(channel = %self.shared.channel, "Graceful bridge shutdown failed: {}", e);
            }
        }
        if let Err(e) = child.kill().await {
            debug!(channel = %self.shared.channel, "Failed to kill bridge process: {}", e);
        }
        self.shared.close();
        info!(channel = %self.shared.channel, "Bridge process destroyed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    /// Write a shell script standing in for the bridge. It records each
    /// command it reads to `commands.log` next to itself.
    fn fake_bridge(dir: &Path, body: &str) -> BridgeSettings {
        let script = dir.join("bridge.sh");
        let prelude = "LOG=\"$(dirname \"$0\")/commands.log\"\nrecv() { read -r line; echo \"$line\" >> \"$LOG\"; }\n";
        std::fs::write(&script, format!("{}{}", prelude, body)).unwrap();
        BridgeSettings {
            runtime: PathBuf::from("sh"),
            script,
            command_timeout: Duration::from_secs(5),
            init_timeout: Duration::from_secs(5),
        }
    }

    fn spec(dir: &Path) -> ConnectionSpec {
        ConnectionSpec {
            channel: ChannelId::from(3000),
            session_dir: dir.join("session-3000"),
        }
    }

    fn commands(dir: &Path) -> Vec<Value> {
        std::fs::read_to_string(dir.join("commands.log"))
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn forwards_events_and_replies() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = fake_bridge(
            tmp.path(),
            r#"
echo '{"type":"qr","code":"ABC123"}'
recv
echo '{"type":"reply","id":1,"ok":true,"result":null}'
echo '{"type":"ready"}'
recv
echo '{"type":"reply","id":2,"ok":true,"result":{"id":"true_123@c.us_3EB0"}}'
recv
"#,
        );
        let (conn, mut events) =
            BridgeConnection::spawn(&settings, &spec(tmp.path()), vec![]).unwrap();

        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::PairingCode("ABC123".into()))
        );
        conn.initialize().await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Ready));

        let id = conn
            .send("+1 555 0100", &OutgoingMessage::text("hi"))
            .await
            .unwrap();
        assert_eq!(id, MessageId("true_123@c.us_3EB0".into()));

        conn.destroy().await;
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Disconnected("bridge process exited".into()))
        );

        let sent = commands(tmp.path());
        assert_eq!(sent[0]["cmd"], "init");
        assert!(sent[0]["executablePath"].is_null());
        assert_eq!(sent[1]["cmd"], "send");
        assert_eq!(sent[1]["to"], "15550100@c.us");
        assert_eq!(sent[1]["text"], "hi");
        assert_eq!(sent[2]["cmd"], "destroy");
    }

    #[tokio::test]
    async fn launch_failure_falls_through_to_next_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = fake_bridge(
            tmp.path(),
            r#"
recv
echo '{"type":"reply","id":1,"ok":false,"error":"spawn ENOENT","kind":"launch"}'
recv
echo '{"type":"reply","id":2,"ok":true,"result":null}'
recv
"#,
        );
        let chrome = PathBuf::from("/opt/chrome/chrome");
        let (conn, _events) =
            BridgeConnection::spawn(&settings, &spec(tmp.path()), vec![chrome.clone()]).unwrap();

        conn.initialize().await.unwrap();
        let sent = commands(tmp.path());
        assert_eq!(sent[0]["executablePath"], "/opt/chrome/chrome");
        assert!(sent[1]["executablePath"].is_null());
        conn.destroy().await;
    }

    #[tokio::test]
    async fn all_launch_strategies_failing_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = fake_bridge(
            tmp.path(),
            r#"
recv
echo '{"type":"reply","id":1,"ok":false,"error":"no browser","kind":"launch"}'
recv
"#,
        );
        let (conn, _events) =
            BridgeConnection::spawn(&settings, &spec(tmp.path()), vec![]).unwrap();

        match conn.initialize().await {
            Err(ConnectionError::BrowserLaunch(reason)) => assert!(reason.contains("no browser")),
            other => panic!("expected launch failure, got {:?}", other),
        }
        conn.destroy().await;
    }

    #[tokio::test]
    async fn process_exit_fails_pending_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = fake_bridge(tmp.path(), "recv\nexit 0\n");
        let (conn, mut events) =
            BridgeConnection::spawn(&settings, &spec(tmp.path()), vec![]).unwrap();

        let err = conn.state().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed), "got {:?}", err);
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Disconnected("bridge process exited".into()))
        );

        let err = conn.logout().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
        conn.destroy().await;
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = fake_bridge(tmp.path(), "recv\nrecv\n");
        settings.command_timeout = Duration::from_millis(200);
        let (conn, _events) =
            BridgeConnection::spawn(&settings, &spec(tmp.path()), vec![]).unwrap();

        let err = conn.state().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
        conn.destroy().await;
    }

    #[tokio::test]
    async fn invalid_recipient_never_reaches_bridge() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = fake_bridge(tmp.path(), "recv\n");
        let (conn, _events) =
            BridgeConnection::spawn(&settings, &spec(tmp.path()), vec![]).unwrap();

        let err = conn
            .send("no digits", &OutgoingMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Delivery(_)));
        assert!(commands(tmp.path()).is_empty());
        conn.destroy().await;
    }
}
