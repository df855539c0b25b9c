//! Relay error types.
//!
//! A single error taxonomy shared by the client engine, its callers and the
//! event stream. Errors are cheap to clone because the same value is stored in
//! the last-error slot, emitted to listeners and returned at the call site.

use std::io;
use thiserror::Error;

use crate::endpoint::AddrError;

/// Main error type for client operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The connection is closed (or was never opened).
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation did not complete before its deadline.
    #[error("timeout")]
    Timeout,

    /// The socket failed underneath an established connection.
    #[error("broken socket: {0}")]
    BrokenSocket(String),

    /// The peer stopped answering keepalive pings, or reported us stale.
    #[error("stale connection")]
    StaleConnection,

    /// A request was published but no subscriber was listening.
    #[error("no responders available for request")]
    NoResponders,

    /// A subject or queue group failed validation.
    #[error("invalid subject: {0}")]
    BadSubject(String),

    /// The server refused the connection credentials.
    #[error("authorization violation: {0}")]
    Authorization(String),

    /// Any other `-ERR` reported by the server.
    #[error("server error: {0}")]
    Server(String),

    /// Malformed or unexpected protocol traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every server in the pool was tried without success.
    #[error("no servers available for connection")]
    NoServers,

    /// The outgoing buffer cap was hit while disconnected.
    #[error("outgoing buffer full: {pending} bytes pending (limit: {limit})")]
    Backpressure { pending: usize, limit: usize },

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A server address could not be parsed.
    #[error(transparent)]
    InvalidAddress(#[from] AddrError),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::BrokenSocket(err.to_string()),
        }
    }
}

impl ClientError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a broken-socket error with a message
    pub fn broken_socket(msg: impl Into<String>) -> Self {
        Self::BrokenSocket(msg.into())
    }

    /// Map the reason text of a `-ERR` line onto the taxonomy.
    ///
    /// Matching is case-insensitive; surrounding quotes are ignored.
    ///
    /// ```
    /// use relay_core::error::ClientError;
    ///
    /// assert_eq!(ClientError::from_server("'Stale Connection'"), ClientError::StaleConnection);
    /// assert!(matches!(
    ///     ClientError::from_server("Authorization Violation"),
    ///     ClientError::Authorization(_)
    /// ));
    /// ```
    #[must_use]
    pub fn from_server(reason: &str) -> Self {
        let reason = reason.trim().trim_matches('\'').trim_matches('"').trim();
        let lower = reason.to_ascii_lowercase();

        if lower.starts_with("stale connection") {
            Self::StaleConnection
        } else if lower.starts_with("authorization violation")
            || lower.starts_with("authentication")
            || lower.starts_with("user authentication")
        {
            Self::Authorization(reason.to_string())
        } else if lower.starts_with("invalid subject") {
            Self::BadSubject(reason.to_string())
        } else {
            Self::Server(reason.to_string())
        }
    }

    /// Whether this error, reported by the server, means the link is going away.
    ///
    /// Non-fatal kinds (bad subject, permission violations) are recorded but the
    /// connection stays up.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::StaleConnection
            | Self::Authorization(_)
            | Self::BrokenSocket(_)
            | Self::ConnectionClosed
            | Self::Protocol(_) => true,
            Self::Server(reason) => {
                let lower = reason.to_ascii_lowercase();
                !(lower.starts_with("permissions violation")
                    || lower.starts_with("invalid queue name"))
            }
            _ => false,
        }
    }

    /// Check if this is a transient socket-level failure.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::BrokenSocket(_) | Self::StaleConnection | Self::ConnectionClosed
        )
    }
}
