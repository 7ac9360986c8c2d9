//! # Built-in Middleware
//!
//! - [`ping`]: answers [`OpCode::PING`] with an empty [`OpCode::PONG`] and ends the chain.
//! - [`logger`]: logs peer, op code and sequence id of every pack.
//! - [`recovery`]: turns a panicking handler into a server-error reply.
//! - [`RateLimiter`]: fixed-window request cap per peer IP.
//!
//! Ping belongs at the front of the chain; recovery only protects what runs
//! after it.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::core::packet::OpCode;
use crate::protocol::context::Context;
use crate::protocol::dispatcher::Handler;

/// Reply to ping with an empty pong and stop; pass anything else on.
pub fn ping(ctx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        if ctx.op_code() != OpCode::PING {
            ctx.next().await;
            return;
        }
        if let Err(e) = ctx.write_with_op_code(OpCode::PONG, Vec::new()).await {
            error!(error = %e, sequence_id = ctx.sequence_id(), "ping response write error");
        }
        ctx.abort();
    })
}

/// Log the request, then continue
pub fn logger(ctx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        match ctx.peer_addr() {
            Some(peer) => info!(
                %peer,
                op_code = %ctx.op_code(),
                sequence_id = ctx.sequence_id(),
                bytes = ctx.payload().len(),
                "request"
            ),
            None => info!(
                op_code = %ctx.op_code(),
                sequence_id = ctx.sequence_id(),
                bytes = ctx.payload().len(),
                "request"
            ),
        }
        ctx.next().await;
    })
}

/// Run the rest of the chain, converting a panic into a server-error reply
pub fn recovery(ctx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        let outcome = AssertUnwindSafe(ctx.next()).catch_unwind().await;
        let Err(panic) = outcome else {
            return;
        };

        let backtrace = Backtrace::force_capture();
        error!(
            op_code = %ctx.op_code(),
            sequence_id = ctx.sequence_id(),
            panic = %panic_message(panic.as_ref()),
            %backtrace,
            "panic recovered"
        );
        if let Some(metrics) = ctx.metrics() {
            metrics.panic_recovered();
        }
        ctx.abort();
        if let Err(e) = ctx.server_error().await {
            error!(error = %e, "server error response write error");
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window rate limiter keyed by peer address (IP and port).
///
/// Each peer may send `max_requests` packs per `window`; the excess gets a
/// server-error reply and the chain stops. Packs without a peer address pass
/// through.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<SocketAddr, Window>>,
}

/// Prune expired windows once the map grows past this many peers
const PRUNE_THRESHOLD: usize = 4096;

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `peer`; `false` when over the limit
    pub fn check(&self, peer: SocketAddr) -> bool {
        let now = Instant::now();
        let Ok(mut windows) = self.windows.lock() else {
            // a poisoned map only loses counts; let traffic through
            warn!(%peer, "rate limiter state poisoned, admitting request");
            return true;
        };

        if windows.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = windows.entry(peer).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Number of peers currently tracked
    pub fn tracked_peers(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }
}

impl Handler for RateLimiter {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(peer) = ctx.peer_addr() else {
                ctx.next().await;
                return;
            };
            if self.check(peer) {
                ctx.next().await;
                return;
            }

            warn!(%peer, op_code = %ctx.op_code(), "rate limit exceeded");
            if let Some(metrics) = ctx.metrics() {
                metrics.rate_limited();
            }
            if let Err(e) = ctx.server_error().await {
                error!(error = %e, %peer, "rate limit response write error");
            }
            ctx.abort();
        })
    }
}
