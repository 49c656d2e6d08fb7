use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use channel_supervisor::testing::{FakeConnection, FakeConnector};
use channel_supervisor::{ChannelId, ChannelStatus, ChannelSupervisor, ConnectionEvent};
use wa_bridge::{EnvExecutableResolver, ResolverSettings};

use crate::AppState;
use crate::config::{FileConfig, GatewayConfig};

/// Build an `AppState` on top of a [`FakeConnector`] with a session root in
/// a temp dir. Callers must hold the `TempDir` for the lifetime of the test.
pub fn test_app_state() -> (AppState, FakeConnector, tempfile::TempDir) {
    test_app_state_with(None)
}

/// Like `test_app_state`, but with an API token configured.
pub fn test_app_state_with_token(token: &str) -> (AppState, FakeConnector, tempfile::TempDir) {
    test_app_state_with(Some(token.to_string()))
}

fn test_app_state_with(api_token: Option<String>) -> (AppState, FakeConnector, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();

    let mut fc = FileConfig::default();
    fc.server.api_token = api_token;
    fc.channels.session_dir = tmp.path().join("sessions");
    let mut config = GatewayConfig::from_file(&fc).unwrap();
    config.pairing_wait = Duration::from_millis(300);
    config.supervisor.poll_interval = Duration::from_millis(10);
    config.supervisor.status_timeout = Duration::from_millis(200);
    config.supervisor.backoff.base_delay = Duration::from_millis(50);
    config.supervisor.backoff.cap_delay = Duration::from_millis(100);
    config.supervisor.backoff.max_retries = 2;

    let connector = FakeConnector::new();
    let supervisor = ChannelSupervisor::new(Arc::new(connector.clone()), config.supervisor.clone());
    let resolver = EnvExecutableResolver::with_env(
        ResolverSettings {
            cache_dir: Some(tmp.path().join("puppeteer")),
            ..Default::default()
        },
        |_| None,
    );

    let state = AppState {
        supervisor,
        resolver: Arc::new(resolver),
        config: Arc::new(config),
        http: reqwest::Client::new(),
    };
    (state, connector, tmp)
}

/// Poll the supervisor until `id` reaches `status`.
pub async fn wait_for_status(state: &AppState, id: &ChannelId, status: ChannelStatus) {
    for _ in 0..200 {
        if state.supervisor.status(id).await.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("channel {} never reached {}", id, status);
}

/// Start `id` and drive its fake connection to `CONNECTED`.
pub async fn connect_channel(
    state: &AppState,
    connector: &FakeConnector,
    id: &ChannelId,
) -> Arc<FakeConnection> {
    state.supervisor.start_channel(id).await.unwrap();
    let connection = connector.latest().unwrap();
    connection.emit(ConnectionEvent::Ready).await;
    wait_for_status(state, id, ChannelStatus::Connected).await;
    connection
}

pub async fn json_body(resp: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Copy of `state` with a different body/download size limit.
pub fn with_max_body_bytes(state: AppState, max_body_bytes: usize) -> AppState {
    let mut config = (*state.config).clone();
    config.max_body_bytes = max_body_bytes;
    AppState {
        config: Arc::new(config),
        ..state
    }
}
