//! WhatsApp Web backend for `channel_supervisor`.
//!
//! The web client library runs inside a small Node.js bridge script, one
//! process per channel. This crate spawns that process, talks to it over a
//! JSON-lines protocol on stdin/stdout and turns what it prints into
//! [`channel_supervisor::ConnectionEvent`]s.
//!
//! It also decides which browser executable the bridge should drive; see
//! [`EnvExecutableResolver`].

mod browser;
mod connector;
mod process;
pub mod protocol;

pub use browser::{
    EXECUTABLE_ENV_VARS, EnvEntry, EnvExecutableResolver, ExecutableResolver, CheckedPath,
    ResolverDiagnostics, ResolverSettings,
};
pub use connector::{BridgeConnector, BridgeSettings};
pub use process::BridgeConnection;
pub use protocol::normalize_recipient;
