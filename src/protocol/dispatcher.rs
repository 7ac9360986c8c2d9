use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::core::packet::OpCode;
use crate::protocol::context::Context;
use crate::protocol::middleware;

/// Anything that can process a [`Context`].
///
/// Closures of the shape `|ctx| Box::pin(async move { .. })` implement this
/// through the blanket impl; stateful middleware implements it directly.
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        (self)(ctx)
    }
}

/// Middlewares followed by one terminal handler, resolved at build time
pub type Chain = Arc<[Arc<dyn Handler>]>;

/// Op-code routing table, immutable once built.
///
/// Every chain is precomputed: for each registered op code the middleware list
/// followed by that handler, plus one fallback chain ending in a not-found reply.
pub struct Router {
    chains: HashMap<OpCode, Chain>,
    fallback: Chain,
    middleware_count: usize,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Chain to run for `op_code`, falling back to the not-found chain
    #[inline]
    pub fn chain_for(&self, op_code: OpCode) -> Chain {
        self.chains
            .get(&op_code)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    #[inline]
    pub fn has_handler(&self, op_code: OpCode) -> bool {
        self.chains.contains_key(&op_code)
    }

    /// Number of registered op codes
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware_count
    }
}

impl Default for Router {
    fn default() -> Self {
        RouterBuilder::new().build()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.chains.keys().map(|c| c.0).collect();
        codes.sort_unstable();
        f.debug_struct("Router")
            .field("op_codes", &codes)
            .field("middleware_count", &self.middleware_count)
            .finish()
    }
}

/// Collects handlers and middleware before the server starts
#[derive(Default)]
pub struct RouterBuilder {
    handlers: HashMap<OpCode, Arc<dyn Handler>>,
    middlewares: Vec<Arc<dyn Handler>>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the built-in ping responder at the front of the chain
    pub fn with_default_middleware(mut self) -> Self {
        self.middlewares.insert(0, Arc::new(middleware::ping));
        self
    }

    /// Register a closure for `op_code`. The last registration for a code wins.
    pub fn handle<F>(self, op_code: impl Into<OpCode>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.handle_with(op_code, handler)
    }

    /// Register any [`Handler`] for `op_code`
    pub fn handle_with<H: Handler>(mut self, op_code: impl Into<OpCode>, handler: H) -> Self {
        let op_code = op_code.into();
        if op_code.is_reserved() {
            warn!(%op_code, "registering handler for reserved op code");
        }
        if self.handlers.insert(op_code, Arc::new(handler)).is_some() {
            warn!(%op_code, "handler replaced");
        }
        self
    }

    /// Append a closure middleware; middlewares run in registration order
    pub fn middleware<F>(self, middleware: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.middleware_with(middleware)
    }

    /// Append any [`Handler`] as middleware
    pub fn middleware_with<H: Handler>(mut self, middleware: H) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn build(self) -> Router {
        let fallback = self.chain_ending_in(Arc::new(fallback_not_found));
        let chains = self
            .handlers
            .iter()
            .map(|(op_code, handler)| (*op_code, self.chain_ending_in(Arc::clone(handler))))
            .collect();

        debug!(
            handlers = self.handlers.len(),
            middlewares = self.middlewares.len(),
            "router built"
        );

        Router {
            chains,
            fallback,
            middleware_count: self.middlewares.len(),
        }
    }

    fn chain_ending_in(&self, terminal: Arc<dyn Handler>) -> Chain {
        self.middlewares
            .iter()
            .cloned()
            .chain(std::iter::once(terminal))
            .collect()
    }
}

fn fallback_not_found(ctx: &mut Context) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        if let Some(metrics) = ctx.metrics() {
            metrics.not_found();
        }
        if let Err(e) = ctx.not_found().await {
            warn!(error = %e, op_code = %ctx.op_code(), "not-found response write error");
        }
    })
}
