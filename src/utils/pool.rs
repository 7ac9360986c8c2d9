//! # Context Pool
//!
//! Freelist of [`Context`] values reused across messages.
//!
//! A context is drawn before a decoded pack is dispatched and goes back when the
//! chain finishes. [`PooledContext`] resets the context on drop, so nothing from
//! the previous message (reply channel, chain, payload) survives into the next.
//! [`TransportPools`] keeps one freelist per transport label, so a datagram
//! burst never drains the contexts stream sessions draw from.
//!
//! ## Usage
//! ```rust,no_run
//! use opwire::utils::pool::ContextPool;
//!
//! let pool = ContextPool::new(64);
//! let ctx = pool.acquire();
//! assert!(!ctx.is_aborted());
//! // Context returned to the pool on drop
//! ```

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::protocol::context::Context;

/// Pooled contexts above this count are dropped instead of kept
const DEFAULT_MAX_IDLE: usize = 1024;

/// A pooled context that resets and returns itself when dropped
pub struct PooledContext {
    ctx: Context,
    pool: Arc<Mutex<Vec<Context>>>,
    max_idle: usize,
}

impl Deref for PooledContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        let mut ctx = std::mem::take(&mut self.ctx);
        ctx.reset();
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < self.max_idle {
                pool.push(ctx);
            }
        }
    }
}

/// Thread-safe context freelist
#[derive(Clone)]
pub struct ContextPool {
    pool: Arc<Mutex<Vec<Context>>>,
    max_idle: usize,
}

impl ContextPool {
    /// Create a pool with `prealloc` contexts ready
    pub fn new(prealloc: usize) -> Self {
        let pool = (0..prealloc).map(|_| Context::new()).collect::<Vec<_>>();
        Self {
            pool: Arc::new(Mutex::new(pool)),
            max_idle: DEFAULT_MAX_IDLE.max(prealloc),
        }
    }

    /// Take a context from the pool, or build one if it is empty
    pub fn acquire(&self) -> PooledContext {
        let ctx = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_default();

        PooledContext {
            ctx,
            pool: Arc::clone(&self.pool),
            max_idle: self.max_idle,
        }
    }

    /// Idle contexts currently in the pool
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(64)
    }
}

/// One [`ContextPool`] per transport label, created on first use
pub struct TransportPools {
    pools: RwLock<HashMap<&'static str, ContextPool>>,
    prealloc: usize,
}

impl TransportPools {
    pub fn new(prealloc: usize) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            prealloc,
        }
    }

    /// Pool for `transport`
    pub fn pool(&self, transport: &'static str) -> ContextPool {
        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(transport)
        {
            return pool.clone();
        }

        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(transport)
            .or_insert_with(|| ContextPool::new(self.prealloc))
            .clone()
    }

    pub fn acquire(&self, transport: &'static str) -> PooledContext {
        self.pool(transport).acquire()
    }

    /// Idle contexts for `transport`; zero if it never drew one
    pub fn available(&self, transport: &'static str) -> usize {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(transport)
            .map_or(0, ContextPool::available)
    }

    /// Labels with a pool, sorted
    pub fn transports(&self) -> Vec<&'static str> {
        let mut labels: Vec<_> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        labels.sort_unstable();
        labels
    }
}

impl Default for TransportPools {
    fn default() -> Self {
        Self::new(64)
    }
}
