//! # Service Layer
//!
//! Everything above a single transport: the dispatch engine, the server
//! lifecycle and the request/response clients.
//!
//! ## Components
//! - **Engine**: router, governor, context pool and task tracking
//! - **Server**: builder, bind, signal handling and graceful shutdown
//! - **Hooks**: ordered shutdown callbacks
//! - **Client**: TCP (optionally TLS) and UDP request helpers

pub mod client;
pub mod engine;
pub mod hooks;
pub mod server;

pub use client::{TcpClient, UdpClient};
pub use engine::Engine;
pub use hooks::ShutdownHooks;
pub use server::{RunningServer, Server, ServerBuilder};
