//! Relay Core
//!
//! This crate contains the protocol-agnostic building blocks of the client:
//! - Error taxonomy (`error`)
//! - Client configuration (`options`)
//! - Server address parsing (`endpoint`)
//! - Server pool with cluster discovery (`pool`)
//! - Reconnect backoff (`reconnect`)
//! - Subject validation (`subject`)
//! - Status and event monitoring (`monitor`)
//! - Runtime timers that stay accurate under load (`timeout`)
//! - Transport seam and TCP connector (`transport`)

// The transport module needs raw fd/socket access for socket configuration
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
pub mod endpoint;
pub mod error;
pub mod monitor;
pub mod options;
pub mod pool;
pub mod reconnect;
pub mod subject;
pub mod timeout;
pub mod transport;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::endpoint::ServerAddr;
    pub use crate::error::{ClientError, Result};
    pub use crate::monitor::{ClientEvent, ClientMonitor, Status};
    pub use crate::options::ClientOptions;
    pub use crate::pool::ServerEntry;
    pub use crate::transport::{Connector, TcpConnector};
}
