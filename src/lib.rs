//! # opwire
//!
//! Op-code routed request/response framework over TCP, UDP and QUIC.
//!
//! Every message on the wire is a [`Pack`]: a 12-byte big-endian header
//! (length, sequence id, op code, version) followed by an opaque payload.
//! Servers register one handler per op code plus any number of middleware;
//! each incoming pack runs through that chain inside its own task, bounded by
//! a shared admission governor.
//!
//! ## Transports
//! - **TCP**: one session per connection, TLS when a certificate is configured
//! - **UDP**: one shared socket, one frame per datagram; DTLS with the `dtls`
//!   feature and a certificate
//! - **QUIC**: TLS 1.3, frames on bidirectional streams and unreliable datagrams
//!
//! ## Example
//! ```rust,no_run
//! use opwire::config::NetworkConfig;
//! use opwire::protocol::middleware;
//! use opwire::service::ServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> opwire::Result<()> {
//!     let config = NetworkConfig::from_env()?;
//!     opwire::utils::logging::init_logging(&config.effective_logging())?;
//!
//!     ServerBuilder::new(config)
//!         .with_default_middleware()
//!         .middleware(middleware::recovery)
//!         .handle(1000u16, |ctx| {
//!             Box::pin(async move {
//!                 let _ = ctx.write(b"hello".to_vec()).await;
//!             })
//!         })
//!         .build()?
//!         .serve()
//!         .await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::codec::PackCodec;
pub use crate::core::packet::{OpCode, Pack};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::{Context, Router};
pub use crate::service::{Engine, ServerBuilder};
