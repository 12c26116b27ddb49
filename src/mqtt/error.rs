//! Error definitions for the broker session

use thiserror::Error;

use super::ConnectionState;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The reachability probe never succeeded within the retry bound
    #[error("broker {host} unreachable after {attempts} probes")]
    Unreachable { host: String, attempts: u32 },

    /// Handshake or authentication failure; fatal at startup
    #[error("broker connection failed: {0}")]
    Connect(String),

    /// The transport rejected a publish
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Publish attempted outside `Connected`; the message was dropped
    #[error("session is {state:?}, dropped publish to {topic}")]
    NotConnected {
        state: ConnectionState,
        topic: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}
