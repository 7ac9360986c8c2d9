//! # Dispatch Engine
//!
//! The single "process one frame" path shared by every transport.
//!
//! A transport reads a frame, builds a [`ReplyChannel`] for it and calls
//! [`Engine::dispatch`]. The engine then:
//! 1. waits for a governor unit (backpressure lands on the reading task),
//! 2. draws a context from the reply's transport pool and binds pack, reply
//!    channel and chain,
//! 3. spawns the chain as a tracked task that releases the unit and returns the
//!    context when it ends, however it ends.
//!
//! Spawning requires a current Tokio runtime; without one the frame is dropped
//! with [`ProtocolError::SpawnError`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::core::codec::PackCodec;
use crate::core::packet::Pack;
use crate::error::{ProtocolError, Result};
use crate::protocol::context::ReplyChannel;
use crate::protocol::dispatcher::Router;
use crate::utils::governor::Governor;
use crate::utils::metrics::Metrics;
use crate::utils::pool::TransportPools;

/// Shared router, governor, context pools and task tracking
pub struct Engine {
    router: Router,
    governor: Governor,
    pools: TransportPools,
    metrics: Arc<Metrics>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(router: Router, worker_capacity: usize) -> Self {
        Self {
            router,
            governor: Governor::new(worker_capacity),
            pools: TransportPools::default(),
            metrics: Arc::new(Metrics::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn pools(&self) -> &TransportPools {
        &self.pools
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Cancelled once the server starts shutting down
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn a tracked task on the current runtime
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|e| {
            self.metrics.spawn_failure();
            ProtocolError::SpawnError(e.to_string())
        })?;
        self.tracker.spawn_on(task, &handle);
        Ok(())
    }

    /// Run the handler chain for one decoded pack.
    ///
    /// Returns once the chain has been admitted and spawned, not when it ends.
    pub async fn dispatch(
        &self,
        pack: Pack,
        reply: Arc<dyn ReplyChannel>,
        codec: PackCodec,
    ) -> Result<()> {
        self.metrics.frame_received(pack.encoded_len() as u64);

        let permit = self.governor.acquire().await?;
        let chain = self.router.chain_for(pack.op_code());

        let mut ctx = self.pools.acquire(reply.transport());
        ctx.prepare(pack, reply, codec, chain, Some(Arc::clone(&self.metrics)));

        self.spawn(async move {
            ctx.next().await;
            drop(ctx);
            drop(permit);
        })
    }

    /// Tasks still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop tracking new tasks and wait up to `grace` for running ones.
    ///
    /// Readers still waiting on the governor are turned away. Returns `true` if
    /// everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        self.governor.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                debug!("all in-flight tasks finished");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    grace_ms = grace.as_millis() as u64,
                    "grace period elapsed with tasks still running"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("capacity", &self.governor.capacity())
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}
