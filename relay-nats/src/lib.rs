//! # Relay NATS
//!
//! Client for the NATS text protocol on `compio`.
//!
//! ## Overview
//!
//! - **Publish / subscribe** with `*` and `>` wildcards and queue groups
//! - **Request / reply** over unique inbox subjects, with deadlines
//! - **Reconnect** across a server pool that grows from cluster discovery
//! - **Keepalive** PINGs with stale-connection detection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay_core::prelude::*;
//! use relay_nats::Client;
//! use std::time::Duration;
//!
//! #[compio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientOptions::default())?;
//!     client.connect().await?;
//!
//!     let reply = client.request("time.now", "", Duration::from_secs(1)).await?;
//!     println!("{:?}", reply.payload);
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Layout
//!
//! - Sans-IO pieces: `codec`, `registry`, `correlator`, `outbox`, `pinger`
//! - `handshake` runs INFO / CONNECT / PING / PONG on a fresh transport
//! - `engine` is the task that owns the connection
//! - `client` is the handle applications hold

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::let_underscore_future)]

// Internal modules (not part of public API)
mod engine;

pub mod client;
pub mod codec;
pub mod correlator;
pub mod handshake;
pub mod info;
pub mod message;
pub mod outbox;
pub mod pinger;
pub mod registry;

pub use client::{Client, SubscribeOptions, Subscriber};
pub use info::ServerInfo;
pub use message::{Message, Sid};

pub mod prelude {
    pub use crate::client::{Client, SubscribeOptions, Subscriber};
    pub use crate::info::ServerInfo;
    pub use crate::message::{Message, Sid};
    pub use relay_core::prelude::*;
}
