//! Shutdown hooks, run in registration order once the server stops accepting.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, info};

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Vec<(String, Hook)>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let hook: Hook = Box::new(move || -> BoxFuture<'static, ()> {
            Box::pin(async move { hook() })
        });
        self.hooks.push((name.into(), hook));
    }

    pub fn add_async<F, Fut>(&mut self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Box::new(move || -> BoxFuture<'static, ()> { Box::pin(hook()) });
        self.hooks.push((name.into(), hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook in order. A panicking hook is logged and the rest still run.
    pub async fn run(self) {
        for (name, hook) in self.hooks {
            info!(hook = %name, "running shutdown hook");
            if AssertUnwindSafe(async move { hook().await })
                .catch_unwind()
                .await
                .is_err()
            {
                error!(hook = %name, "shutdown hook panicked");
            }
        }
    }
}
