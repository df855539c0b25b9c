//! # Relay
//!
//! A resilient publish/subscribe messaging client built on `io_uring`.
//!
//! ## Architecture
//!
//! - **`relay-core`**: Options, errors, server pool, backoff and the transport seam
//! - **Protocol crates**: Sans-IO codecs plus a connection engine per protocol
//! - **`relay`**: Public API surface (this crate)
//!
//! ## Protocols (opt-in via features)
//!
//! - **`nats`** - NATS text protocol client (enabled by default)
//!
//! ```toml
//! [dependencies]
//! relay = { version = "0.1", features = ["nats"] }
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "nats")]
//! use relay::nats::prelude::*;
//!
//! # #[cfg(feature = "nats")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = relay::nats::connect("nats://127.0.0.1:4222").await?;
//!
//! let sub = client.subscribe("updates.>")?;
//! client.publish("updates.eu", "ready")?;
//!
//! if let Some(msg) = sub.next().await {
//!     println!("{}: {:?}", msg.subject, msg.payload);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Resilience
//!
//! - Lost connections are re-established across the server pool, which grows
//!   from the cluster's own announcements
//! - Subscriptions are replayed and buffered publishes flushed, in that order
//! - Keepalive PINGs detect peers that stopped answering

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;
pub use relay_core::error::{ClientError, Result};
pub use relay_core::monitor::{ClientEvent, Status};
pub use relay_core::options::ClientOptions;

pub mod dev_tracing;

// Protocol modules (opt-in via features)
#[cfg(feature = "nats")]
pub mod nats;
