//! # MQTT Broker Session
//!
//! Owns everything between a finished [`Reading`](crate::sensor::Reading)
//! payload and the broker: reachability gating, last-will registration, the
//! connection lifecycle and a publish entry point that can be shared between
//! the scheduler jobs and the event dispatcher.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── error.rs         - SessionError
//! ├── message.rs       - Outbound message and topic layout
//! ├── reachability.rs  - ping probe used before the first connect
//! ├── session.rs       - startup state machine and the shared BrokerSession
//! └── transport.rs     - rumqttc implementation of BrokerTransport
//! ```
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Disconnected ──(probe ok)──► Reachable ──(CONNACK)──► Connected
//!                                                        │    ▲
//!                                          (network loss)│    │(auto-reconnect,
//!                                                        ▼    │ re-announce online)
//!                                                        Lost ─┘
//! ```
//!
//! Publishing is only attempted in `Connected`. Anything published in another
//! state is dropped with [`SessionError::NotConnected`]; sensor data is never
//! queued for later.

pub mod error;
pub mod message;
pub mod reachability;
pub mod session;
pub mod transport;

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;

pub use error::SessionError;
pub use message::{Outbound, Topics, OFFLINE, ONLINE};
pub use session::BrokerSession;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Reachable,
    Connected,
    Lost,
}

/// Connectivity changes reported by a running transport loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Lost(String),
    Reconnected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

/// Bound on the reachability probe loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` probes forever
    pub max_attempts: Option<u32>,
}

/// Broker client capability the session is built on
///
/// `connect` must not return before the broker accepted the session. The
/// last will has to be registered before `connect` is called.
pub trait BrokerTransport: Send + Sync {
    fn set_last_will(&mut self, will: Outbound);

    fn connect(&mut self, endpoint: Endpoint) -> BoxFuture<'_, Result<(), SessionError>>;

    /// Starts the background network loop and returns its connectivity events
    fn start_loop(&mut self) -> Result<mpsc::Receiver<LinkEvent>, SessionError>;

    fn publish(&self, message: Outbound) -> BoxFuture<'_, Result<(), SessionError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), SessionError>>;
}

/// Out-of-band check that the broker host answers at all
pub trait Reachability: Send + Sync {
    fn is_host_reachable<'a>(&'a self, host: &'a str) -> BoxFuture<'a, bool>;
}
