use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use channel_supervisor::{BackoffPolicy, ChannelId, SupervisorConfig};
use wa_bridge::{BridgeSettings, ResolverSettings};

// =============================================================================
// Tunable config (figment-deserialized from defaults / gateway.toml / env vars)
// =============================================================================
//
//   gateway.toml:    [server]
//                    port = 3001
//
//   env var:         GATEWAY_SERVER__PORT=3001   (double underscore = nesting)
//
//   plain env:       PORT=3001   (the deployment-platform names, see PLAIN_ENV)

/// Unprefixed env vars and the config keys they set. These win over everything.
const PLAIN_ENV: [(&str, &str); 6] = [
    ("PORT", "server.port"),
    ("API_TOKEN", "server.api_token"),
    ("SESSION_DIR", "channels.session_dir"),
    ("PUPPETEER_CACHE_DIR", "browser.cache_dir"),
    ("NODE_PATH_BIN", "bridge.runtime"),
    ("BRIDGE_SCRIPT", "bridge.script"),
];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub channels: ChannelsFileConfig,
    #[serde(default)]
    pub backoff: BackoffFileConfig,
    #[serde(default)]
    pub bridge: BridgeFileConfig,
    #[serde(default)]
    pub browser: BrowserFileConfig,
}

/// `[server]` in gateway.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret for every non-health route. Unset or empty disables auth.
    #[serde(default, deserialize_with = "lenient_string")]
    pub api_token: Option<String>,
    /// How long `/qr` waits for a pairing code before answering with a placeholder.
    #[serde(default = "default_pairing_wait_secs")]
    pub pairing_wait_secs: u64,
    /// Upper bound for request bodies and downloaded media, in MiB.
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: None,
            pairing_wait_secs: default_pairing_wait_secs(),
            max_body_mb: default_max_body_mb(),
        }
    }
}

/// `[channels]` in gateway.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelsFileConfig {
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
    /// Start the channel named after the listen port on boot.
    #[serde(default = "default_true")]
    pub start_default: bool,
    /// Additional channels started on boot.
    #[serde(default)]
    pub autostart: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,
}

impl Default for ChannelsFileConfig {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
            start_default: true,
            autostart: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            status_timeout_ms: default_status_timeout_ms(),
        }
    }
}

/// `[backoff]` in gateway.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffFileConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BackoffFileConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            multiplier: default_multiplier(),
            cap_ms: default_cap_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// `[bridge]` in gateway.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeFileConfig {
    #[serde(default = "default_runtime")]
    pub runtime: PathBuf,
    #[serde(default = "default_script")]
    pub script: PathBuf,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
}

impl Default for BridgeFileConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            script: default_script(),
            command_timeout_secs: default_command_timeout_secs(),
            init_timeout_secs: default_init_timeout_secs(),
        }
    }
}

/// `[browser]` in gateway.toml.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BrowserFileConfig {
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_pairing_wait_secs() -> u64 {
    30
}
fn default_max_body_mb() -> usize {
    64
}
fn default_session_dir() -> PathBuf {
    PathBuf::from(".wwebjs_auth")
}
fn default_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_status_timeout_ms() -> u64 {
    3000
}
fn default_base_ms() -> u64 {
    5000
}
fn default_multiplier() -> u32 {
    2
}
fn default_cap_ms() -> u64 {
    60_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_runtime() -> PathBuf {
    PathBuf::from("node")
}
fn default_script() -> PathBuf {
    PathBuf::from("bridge/index.js")
}
fn default_command_timeout_secs() -> u64 {
    60
}
fn default_init_timeout_secs() -> u64 {
    180
}

/// Env values are type-sniffed, so `API_TOKEN=12345` arrives as a number.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
        Flag(bool),
    }

    let raw = Option::<Raw>::deserialize(deserializer)?;
    Ok(raw
        .map(|raw| match raw {
            Raw::Text(s) => s,
            Raw::Signed(n) => n.to_string(),
            Raw::Unsigned(n) => n.to_string(),
            Raw::Float(n) => n.to_string(),
            Raw::Flag(b) => b.to_string(),
        })
        .filter(|s| !s.trim().is_empty()))
}

/// Build the layered figment: struct defaults, then the TOML file at `path`
/// (missing is fine), then `GATEWAY_*` env vars, then the plain env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `GATEWAY_BACKOFF__MAX_RETRIES=3`  →  `backoff.max_retries = 3`
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("GATEWAY_").split("__"))
        .merge(
            Env::raw()
                .only(&PLAIN_ENV.map(|(name, _)| name))
                .map(|key| {
                    PLAIN_ENV
                        .iter()
                        .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                        .map(|(_, path)| (*path).into())
                        .unwrap_or_else(|| key.into())
                }),
        )
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub api_token: Option<String>,
    pub pairing_wait: Duration,
    /// Largest accepted request body or media download, in bytes.
    pub max_body_bytes: usize,
    /// Channels to start on boot, default channel first.
    pub autostart: Vec<ChannelId>,
    pub supervisor: SupervisorConfig,
    pub bridge: BridgeSettings,
    pub browser: ResolverSettings,
}

impl GatewayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let mut autostart = Vec::new();
        if fc.channels.start_default {
            autostart.push(ChannelId::from(fc.server.port));
        }
        for raw in &fc.channels.autostart {
            let id = ChannelId::parse(raw).context("Invalid entry in channels.autostart")?;
            if !autostart.contains(&id) {
                autostart.push(id);
            }
        }

        Ok(Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            api_token: fc.server.api_token.clone(),
            pairing_wait: Duration::from_secs(fc.server.pairing_wait_secs),
            max_body_bytes: fc.server.max_body_mb.saturating_mul(1024 * 1024),
            autostart,
            supervisor: SupervisorConfig {
                sessions_root: fc.channels.session_dir.clone(),
                backoff: BackoffPolicy {
                    base_delay: Duration::from_millis(fc.backoff.base_ms),
                    multiplier: fc.backoff.multiplier,
                    cap_delay: Duration::from_millis(fc.backoff.cap_ms),
                    max_retries: fc.backoff.max_retries,
                },
                poll_interval: Duration::from_millis(fc.channels.poll_interval_ms),
                status_timeout: Duration::from_millis(fc.channels.status_timeout_ms),
            },
            bridge: BridgeSettings {
                runtime: fc.bridge.runtime.clone(),
                script: fc.bridge.script.clone(),
                command_timeout: Duration::from_secs(fc.bridge.command_timeout_secs),
                init_timeout: Duration::from_secs(fc.bridge.init_timeout_secs),
            },
            browser: ResolverSettings {
                executable: fc.browser.executable.clone(),
                extra_paths: fc.browser.extra_paths.clone(),
                cache_dir: fc.browser.cache_dir.clone(),
            },
        })
    }

    /// Channel used when a request does not name one.
    pub fn default_channel(&self) -> ChannelId {
        ChannelId::from(self.port)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn extract(path: &str) -> FileConfig {
        load_config(Path::new(path)).extract().unwrap()
    }

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "0.0.0.0");
        assert_eq!(fc.server.port, 3000);
        assert!(fc.server.api_token.is_none());
        assert_eq!(fc.channels.session_dir, PathBuf::from(".wwebjs_auth"));
        assert_eq!(fc.backoff.base_ms, 5000);
        assert_eq!(fc.backoff.max_retries, 5);
        assert_eq!(fc.bridge.runtime, PathBuf::from("node"));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let fc = extract("gateway.toml");
            assert_eq!(fc.server.port, 3000);
            assert_eq!(fc.server.pairing_wait_secs, 30);
            assert_eq!(fc.server.max_body_mb, 64);
            assert!(fc.channels.autostart.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gateway.toml",
                r#"
                [server]
                port = 3005
                api_token = "s3cret"

                [channels]
                autostart = ["3006", "sales"]

                [backoff]
                base_ms = 1000
                max_retries = 2

                [browser]
                extra_paths = ["/opt/chrome/chrome"]
                "#,
            )?;
            let fc = extract("gateway.toml");
            assert_eq!(fc.server.port, 3005);
            assert_eq!(fc.server.api_token.as_deref(), Some("s3cret"));
            assert_eq!(fc.channels.autostart, vec!["3006", "sales"]);
            assert_eq!(fc.backoff.base_ms, 1000);
            assert_eq!(fc.backoff.cap_ms, 60_000);
            assert_eq!(fc.backoff.max_retries, 2);
            assert_eq!(fc.browser.extra_paths, vec![PathBuf::from("/opt/chrome/chrome")]);
            Ok(())
        });
    }

    #[test]
    fn test_prefixed_env_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.create_file("gateway.toml", "[backoff]\nmax_retries = 2\n")?;
            jail.set_env("GATEWAY_BACKOFF__MAX_RETRIES", "7");
            jail.set_env("GATEWAY_BRIDGE__SCRIPT", "/srv/bridge.js");
            let fc = extract("gateway.toml");
            assert_eq!(fc.backoff.max_retries, 7);
            assert_eq!(fc.bridge.script, PathBuf::from("/srv/bridge.js"));
            Ok(())
        });
    }

    #[test]
    fn test_plain_env_vars_win() {
        Jail::expect_with(|jail| {
            jail.create_file("gateway.toml", "[server]\nport = 3005\n")?;
            jail.set_env("GATEWAY_SERVER__PORT", "3006");
            jail.set_env("PORT", "8080");
            jail.set_env("API_TOKEN", "token-abc");
            jail.set_env("SESSION_DIR", "/data/sessions");
            jail.set_env("PUPPETEER_CACHE_DIR", "/data/puppeteer");
            let fc = extract("gateway.toml");
            assert_eq!(fc.server.port, 8080);
            assert_eq!(fc.server.api_token.as_deref(), Some("token-abc"));
            assert_eq!(fc.channels.session_dir, PathBuf::from("/data/sessions"));
            assert_eq!(fc.browser.cache_dir, Some(PathBuf::from("/data/puppeteer")));
            Ok(())
        });
    }

    #[test]
    fn test_numeric_api_token_is_kept_as_string() {
        Jail::expect_with(|jail| {
            jail.set_env("API_TOKEN", "12345");
            let fc = extract("gateway.toml");
            assert_eq!(fc.server.api_token.as_deref(), Some("12345"));
            Ok(())
        });
    }

    #[test]
    fn test_empty_api_token_disables_auth() {
        Jail::expect_with(|jail| {
            jail.create_file("gateway.toml", "[server]\napi_token = \"  \"\n")?;
            let fc = extract("gateway.toml");
            assert!(fc.server.api_token.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_gateway_config_from_file() {
        let mut fc = FileConfig::default();
        fc.server.port = 3001;
        fc.channels.autostart = vec!["3001".into(), "3002".into()];
        fc.backoff.cap_ms = 10_000;
        fc.server.max_body_mb = 8;

        let config = GatewayConfig::from_file(&fc).unwrap();
        assert_eq!(config.max_body_bytes, 8 * 1024 * 1024);
        assert_eq!(config.default_channel(), ChannelId::from(3001));
        assert_eq!(
            config.autostart,
            vec![ChannelId::from(3001), ChannelId::from(3002)]
        );
        assert_eq!(config.supervisor.backoff.cap_delay, Duration::from_secs(10));
        assert_eq!(config.supervisor.poll_interval, Duration::from_millis(500));
        assert_eq!(config.bridge.init_timeout, Duration::from_secs(180));
        assert_eq!(config.bind_addr().unwrap().port(), 3001);
    }

    #[test]
    fn test_gateway_config_without_default_channel() {
        let mut fc = FileConfig::default();
        fc.channels.start_default = false;
        let config = GatewayConfig::from_file(&fc).unwrap();
        assert!(config.autostart.is_empty());
    }

    #[test]
    fn test_gateway_config_rejects_bad_channel_ids() {
        let mut fc = FileConfig::default();
        fc.channels.autostart = vec!["../etc".into()];
        assert!(GatewayConfig::from_file(&fc).is_err());
    }

    #[test]
    fn test_bind_addr_rejects_garbage_host() {
        let mut fc = FileConfig::default();
        fc.server.host = "not a host".into();
        let config = GatewayConfig::from_file(&fc).unwrap();
        assert!(config.bind_addr().is_err());
    }
}
