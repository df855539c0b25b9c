//! Connection status and event monitoring.
//!
//! Every status transition and every state-affecting error is pushed to
//! registered listeners, in the order it happened.

use crate::endpoint::ServerAddr;
use crate::error::ClientError;
use std::fmt;

/// Connection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Not connected and not trying to be.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Handshake completed; traffic flows.
    Connected,
    /// Link lost; dialing the pool.
    Reconnecting,
    /// Terminal until the next `connect()`.
    Closed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Client lifecycle events.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The status moved from one value to another.
    StatusChanged { from: Status, to: Status },

    /// An error was recorded in the last-error slot.
    Error(ClientError),

    /// A discovery merge added servers to the pool.
    ServersDiscovered { added: Vec<ServerAddr> },

    /// The connected server announced it is shutting down.
    LameDuck(ServerAddr),
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusChanged { from, to } => write!(f, "Status {from} -> {to}"),
            Self::Error(err) => write!(f, "Error: {err}"),
            Self::ServersDiscovered { added } => {
                write!(f, "Discovered {} server(s)", added.len())
            }
            Self::LameDuck(addr) => write!(f, "Lame duck mode on {addr}"),
        }
    }
}

/// Handle for receiving client events.
///
/// This is a channel receiver that provides a stream of lifecycle events.
pub type ClientMonitor = flume::Receiver<ClientEvent>;

/// Sender side held by the connection engine.
pub type ClientEventSender = flume::Sender<ClientEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (ClientEventSender, ClientMonitor) {
    flume::unbounded()
}
