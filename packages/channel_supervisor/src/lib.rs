//! Channel Supervisor - per-channel connection lifecycle management
//!
//! This crate owns any number of independently addressable "channels", each
//! wrapping one externally supplied stateful connection. It tracks the last
//! known status and pairing code of every channel, restarts dropped
//! connections with a bounded exponential backoff and offers non-blocking
//! status reads for HTTP handlers.
//!
//! It has no HTTP dependencies and no knowledge of any particular messaging
//! backend: backends plug in through the [`Connector`] and [`Connection`]
//! traits and report what happens to them as [`ConnectionEvent`]s.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use channel_supervisor::{ChannelId, ChannelSupervisor, Connector, SupervisorConfig};
//!
//! async fn run(connector: Arc<dyn Connector>) {
//!     let supervisor = ChannelSupervisor::new(connector, SupervisorConfig::default());
//!     let id = ChannelId::from(3000);
//!
//!     supervisor.start_channel(&id).await.unwrap();
//!
//!     let code = supervisor
//!         .wait_for_pairing_artifact(&id, std::time::Duration::from_secs(30))
//!         .await;
//!     println!("scan this: {:?}", code);
//! }
//! ```

mod backoff;
mod channel;
mod connection;
mod error;
mod supervisor;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backoff::BackoffPolicy;
pub use channel::{
    ChannelId, ChannelSnapshot, ChannelState, ChannelStatus, ConnectionEvent, InvalidChannelId,
    Transition,
};
pub use connection::{
    Connection, ConnectionSpec, Connector, MessageId, OpenedConnection, OutgoingMessage,
};
pub use error::{ConnectionError, SupervisorError};
pub use supervisor::{ChannelSupervisor, SupervisorConfig, SupervisorEvent};
