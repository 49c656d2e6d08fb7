use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use channel_supervisor::{ConnectionError, ConnectionSpec, Connector, OpenedConnection};

use crate::browser::ExecutableResolver;
use crate::process::BridgeConnection;

/// How to launch the bridge process.
#[derive(Clone, Debug)]
pub struct BridgeSettings {
    /// Script interpreter, looked up on `PATH` when not absolute.
    pub runtime: PathBuf,
    pub script: PathBuf,
    pub command_timeout: Duration,
    /// `init` launches a browser and loads the web client, so it gets longer.
    pub init_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            runtime: PathBuf::from("node"),
            script: PathBuf::from("bridge/index.js"),
            command_timeout: Duration::from_secs(60),
            init_timeout: Duration::from_secs(180),
        }
    }
}

/// Opens one bridge process per channel.
pub struct BridgeConnector {
    settings: BridgeSettings,
    resolver: Arc<dyn ExecutableResolver>,
}

impl BridgeConnector {
    pub fn new(settings: BridgeSettings, resolver: Arc<dyn ExecutableResolver>) -> Self {
        Self { settings, resolver }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Check that the bridge can be started at all. Returns the resolved
    /// runtime path.
    pub fn check_installed(&self) -> Result<PathBuf, ConnectionError> {
        let runtime = which::which(&self.settings.runtime).map_err(|e| {
            ConnectionError::LibraryLoad(format!(
                "runtime {} not found: {}",
                self.settings.runtime.display(),
                e
            ))
        })?;
        if !self.settings.script.is_file() {
            return Err(ConnectionError::LibraryLoad(format!(
                "bridge script {} does not exist",
                self.settings.script.display()
            )));
        }
        debug!(
            runtime = %runtime.display(),
            script = %self.settings.script.display(),
            "Bridge runtime available"
        );
        Ok(runtime)
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn open(&self, spec: ConnectionSpec) -> Result<OpenedConnection, ConnectionError> {
        tokio::fs::create_dir_all(&spec.session_dir)
            .await
            .map_err(|e| {
                ConnectionError::LibraryLoad(format!(
                    "cannot create session directory {}: {}",
                    spec.session_dir.display(),
                    e
                ))
            })?;

        // The resolver stats and lists directories
        let resolver = self.resolver.clone();
        let executables = tokio::task::spawn_blocking(move || resolver.candidates())
            .await
            .map_err(|e| {
                ConnectionError::BrowserLaunch(format!("executable lookup failed: {}", e))
            })?;
        info!(
            channel = %spec.channel,
            candidates = executables.len(),
            "Opening bridge connection"
        );

        let (connection, events) = BridgeConnection::spawn(&self.settings, &spec, executables)?;
        Ok(OpenedConnection {
            connection: Arc::new(connection),
            events,
        })
    }
}
