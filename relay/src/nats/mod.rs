//! NATS protocol client.
//!
//! # Types
//!
//! - [`Client`] - Cloneable handle to one connection (publish, subscribe, request)
//! - [`Subscriber`] - Receiving end of a channel subscription
//! - [`Message`] - A delivered message
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use relay::nats::{Client, ClientOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ClientOptions::default()
//!     .with_servers(["nats://10.0.0.1:4222", "nats://10.0.0.2:4222"])
//!     .with_name("billing")
//!     .with_max_reconnect_attempts(None);
//!
//! let client = Client::new(options)?;
//! client.connect().await?;
//!
//! let answer = client.request("rates.eur", "", Duration::from_millis(500)).await?;
//! println!("{:?}", answer.payload);
//! # Ok(())
//! # }
//! ```

use tracing::debug;

pub use relay_core::endpoint::ServerAddr;
pub use relay_core::error::{ClientError, Result};
pub use relay_core::monitor::{ClientEvent, ClientMonitor, Status};
pub use relay_core::options::ClientOptions;
pub use relay_core::pool::ServerEntry;
pub use relay_core::transport::{Connector, TcpConnector, Transport, TransportRead, TransportWrite};
pub use relay_nats::{Client, Message, ServerInfo, Sid, SubscribeOptions, Subscriber};

/// Connect to a comma-separated list of server URLs with default options.
///
/// # Errors
///
/// Fails if a URL is malformed or no server accepts the connection.
pub async fn connect(urls: &str) -> Result<Client> {
    let options = ClientOptions::default().with_servers(urls.split(',').map(str::trim));
    let client = Client::new(options)?;
    client.connect().await?;
    debug!("[CLIENT] Connected to {:?}", client.current_server());
    Ok(client)
}

/// Convenient imports for the NATS client.
///
/// # Example
///
/// ```rust
/// use relay::nats::prelude::*;
///
/// // Now you have:
/// // - Client, Subscriber, SubscribeOptions, Message
/// // - ClientOptions, ClientError, Status, ClientEvent
/// // - Bytes for payloads
/// ```
pub mod prelude {
    pub use super::{
        Client, ClientError, ClientEvent, ClientOptions, Message, Status, SubscribeOptions,
        Subscriber,
    };
    pub use bytes::Bytes;
}
