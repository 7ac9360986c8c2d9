//! # Request Pipeline
//!
//! Per-message context, op-code routing and the built-in middleware.
//!
//! A transport decodes a pack, the engine binds it to a pooled [`Context`] and
//! the [`Router`] supplies the chain to run: registered middleware in order,
//! then the handler for the op code (or the not-found fallback).

pub mod context;
pub mod dispatcher;
pub mod middleware;


pub use context::{Context, ReplyChannel, SessionInfo};
pub use dispatcher::{Chain, Handler, Router, RouterBuilder};
pub use middleware::RateLimiter;
