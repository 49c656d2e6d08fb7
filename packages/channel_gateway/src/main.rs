use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use channel_gateway::config::{FileConfig, GatewayConfig, load_config};
use channel_gateway::{AppState, create_router};
use channel_supervisor::ChannelSupervisor;
use wa_bridge::{BridgeConnector, EnvExecutableResolver, ExecutableResolver};

/// Timeout for downloading media referenced by `/sendMedia`.
const MEDIA_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "channel-gateway")]
#[command(about = "HTTP gateway for supervised WhatsApp channels")]
struct Args {
    /// Config file (missing is fine, defaults and env vars still apply)
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Port to listen on; also the default channel id
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "channel_gateway=debug,channel_supervisor=debug,wa_bridge=debug,tower_http=debug,info"
    } else {
        "channel_gateway=info,channel_supervisor=info,wa_bridge=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(&args.config)
        .extract()
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    let config = Arc::new(GatewayConfig::from_file(&file_config)?);

    info!("Starting channel gateway");

    let resolver: Arc<dyn ExecutableResolver> =
        Arc::new(EnvExecutableResolver::new(config.browser.clone()));
    let connector = BridgeConnector::new(config.bridge.clone(), resolver.clone());

    // Without the bridge nothing can ever connect; fail loudly at startup
    if let Err(e) = connector.check_installed() {
        error!("WhatsApp bridge unavailable: {}", e);
        error!(
            "Install the runtime ({}) and the bridge script ({}) or point bridge.runtime / bridge.script at them",
            config.bridge.runtime.display(),
            config.bridge.script.display()
        );
        std::process::exit(1);
    }
    match resolver.candidates().first() {
        Some(path) => info!("Browser executable: {}", path.display()),
        None => warn!("No browser executable found, the bridge will use its bundled default"),
    }

    let supervisor = ChannelSupervisor::new(Arc::new(connector), config.supervisor.clone());
    info!(
        "Session data under {}",
        config.supervisor.sessions_root.display()
    );

    for id in &config.autostart {
        let supervisor = supervisor.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.start_channel(&id).await {
                warn!(channel = %id, "Failed to start channel on boot: {}", e);
            }
        });
    }

    let http = reqwest::Client::builder()
        .timeout(MEDIA_FETCH_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let state = AppState {
        supervisor: supervisor.clone(),
        resolver,
        config: config.clone(),
        http,
    };
    let app = create_router(state);

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Channel gateway listening on http://{}", actual_addr);
    info!("API endpoints (all accept ?port=<channel>):");
    info!("  GET    /health          - Channel health and live state");
    info!("  GET    /qr, /qr.png     - Pairing code");
    info!("  POST   /send            - Send a text message");
    info!("  POST   /sendMedia       - Send media from a URL or base64");
    info!("  POST   /session/reset   - Log out and re-pair");

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("Stopping channels...");
    supervisor.shutdown().await;
    info!("Shutdown complete");
    server_result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, cleaning up...");
}
