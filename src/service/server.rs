//! # Server Lifecycle
//!
//! Wires configuration, router, engine and one transport together.
//!
//! ```rust,no_run
//! use opwire::config::NetworkConfig;
//! use opwire::service::server::ServerBuilder;
//!
//! # async fn run() -> opwire::error::Result<()> {
//! let server = ServerBuilder::new(NetworkConfig::default())
//!     .with_default_middleware()
//!     .handle(1000u16, |ctx| {
//!         Box::pin(async move {
//!             let body = ctx.payload().to_vec();
//!             if let Err(e) = ctx.write(body).await {
//!                 tracing::warn!(error = %e, "echo failed");
//!             }
//!         })
//!     })
//!     .on_shutdown("flush", || tracing::info!("bye"))
//!     .build()?;
//!
//! // Runs until SIGINT / SIGTERM
//! server.serve().await
//! # }
//! ```
//!
//! ## Shutdown sequence
//! 1. registered shutdown hooks run in order
//! 2. the cancellation token fires: accept loops stop and release their
//!    sockets, session read loops stop
//! 3. in-flight handlers get up to `shutdown_grace` to finish
//! 4. metrics are logged

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{NetworkConfig, TransportKind};
use crate::error::{ProtocolError, Result};
use crate::protocol::context::Context;
use crate::protocol::dispatcher::{Handler, RouterBuilder};
use crate::service::engine::Engine;
use crate::service::hooks::ShutdownHooks;
use crate::transport::quic::QuicTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::tls::TlsServerConfig;
use crate::transport::udp::UdpTransport;
use crate::utils::metrics::Metrics;

/// Collects handlers, middleware and shutdown hooks for one server
pub struct ServerBuilder {
    config: NetworkConfig,
    router: RouterBuilder,
    hooks: ShutdownHooks,
}

impl ServerBuilder {
    /// Bare server: no middleware installed
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            router: RouterBuilder::new(),
            hooks: ShutdownHooks::new(),
        }
    }

    /// Install the built-in ping responder ahead of all other middleware
    pub fn with_default_middleware(mut self) -> Self {
        self.router = self.router.with_default_middleware();
        self
    }

    pub fn handle<F>(mut self, op_code: impl Into<crate::core::packet::OpCode>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.router = self.router.handle(op_code, handler);
        self
    }

    pub fn handle_with<H: Handler>(
        mut self,
        op_code: impl Into<crate::core::packet::OpCode>,
        handler: H,
    ) -> Self {
        self.router = self.router.handle_with(op_code, handler);
        self
    }

    pub fn middleware<F>(mut self, middleware: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.router = self.router.middleware(middleware);
        self
    }

    pub fn middleware_with<H: Handler>(mut self, middleware: H) -> Self {
        self.router = self.router.middleware_with(middleware);
        self
    }

    pub fn on_shutdown<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.add(name, hook);
        self
    }

    pub fn on_shutdown_async<F, Fut>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.add_async(name, hook);
        self
    }

    /// Validate the configuration and freeze the router
    pub fn build(self) -> Result<Server> {
        self.config.validate_strict()?;

        #[cfg(not(feature = "dtls"))]
        if self.config.server.transport == TransportKind::Udp && self.config.server.has_certificate() {
            return Err(ProtocolError::ConfigError(
                "UDP with a certificate needs the `dtls` feature".to_string(),
            ));
        }

        let router = self.router.build();
        let engine = Engine::new(router, self.config.server.worker_capacity);
        Ok(Server {
            config: self.config,
            engine: Arc::new(engine),
            hooks: self.hooks,
        })
    }
}

/// A configured server that has not bound its socket yet
pub struct Server {
    config: NetworkConfig,
    engine: Arc<Engine>,
    hooks: ShutdownHooks,
}

impl Server {
    pub fn builder(config: NetworkConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Bind the configured transport and start accepting in the background
    #[instrument(skip(self), fields(address = %self.config.server.address, transport = %self.config.server.transport))]
    pub async fn bind(self) -> Result<RunningServer> {
        let server = &self.config.server;
        let engine = Arc::clone(&self.engine);
        let tls = TlsServerConfig::from_server_config(server);

        let (local_addr, accept_loop): (SocketAddr, JoinHandle<Result<()>>) = match server.transport {
            TransportKind::Tcp => {
                let acceptor = tls.as_ref().map(TlsServerConfig::acceptor).transpose()?;
                let transport = TcpTransport::bind(&server.address, acceptor, engine, server.read_timeout)
                    .await?
                    .with_handshake_timeout(self.config.quic.handshake_timeout);
                (transport.local_addr()?, tokio::spawn(transport.run()))
            }
            TransportKind::Udp => bind_datagram(&self.config, tls.as_ref(), engine).await?,
            TransportKind::Quic => {
                let tls = tls.as_ref().ok_or_else(|| {
                    ProtocolError::ConfigError("QUIC transport requires cert_file and key_file".into())
                })?;
                let addr: SocketAddr = server.address.parse().map_err(|e| {
                    ProtocolError::ConfigError(format!("Invalid server address '{}': {e}", server.address))
                })?;
                let transport =
                    QuicTransport::bind(addr, tls, &self.config.quic, engine, server.read_timeout)?;
                (transport.local_addr()?, tokio::spawn(transport.run()))
            }
        };

        info!(
            %local_addr,
            transport = %server.transport,
            secure = tls.is_some(),
            handlers = self.engine.router().len(),
            capacity = self.engine.governor().capacity(),
            "Server listening"
        );

        Ok(RunningServer {
            local_addr,
            engine: self.engine,
            hooks: self.hooks,
            accept_loop,
            grace: self.config.server.shutdown_grace,
        })
    }

    /// Serve until SIGINT or SIGTERM, then shut down gracefully
    pub async fn serve(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `signal` resolves, then shut down gracefully
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let running = self.bind().await?;
        let token = running.shutdown_token();
        tokio::select! {
            _ = signal => info!("Shutdown signal received"),
            _ = token.cancelled() => info!("Shutdown triggered"),
        }
        running.shutdown().await
    }
}

#[cfg(feature = "dtls")]
async fn bind_datagram(
    config: &NetworkConfig,
    tls: Option<&TlsServerConfig>,
    engine: Arc<Engine>,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    use crate::transport::dtls::DtlsTransport;

    let server = &config.server;
    match tls {
        Some(tls) => {
            let transport = DtlsTransport::bind(&server.address, tls, engine, server.read_timeout)
                .await?
                .with_handshake_timeout(config.quic.handshake_timeout);
            Ok((transport.local_addr(), tokio::spawn(transport.run())))
        }
        None => {
            let transport = UdpTransport::bind(&server.address, engine, server.read_timeout).await?;
            Ok((transport.local_addr()?, tokio::spawn(transport.run())))
        }
    }
}

#[cfg(not(feature = "dtls"))]
async fn bind_datagram(
    config: &NetworkConfig,
    tls: Option<&TlsServerConfig>,
    engine: Arc<Engine>,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let server = &config.server;
    if tls.is_some() {
        return Err(ProtocolError::ConfigError(
            "UDP with a certificate needs the `dtls` feature".to_string(),
        ));
    }
    let transport = UdpTransport::bind(&server.address, engine, server.read_timeout).await?;
    Ok((transport.local_addr()?, tokio::spawn(transport.run())))
}

/// A bound server accepting in the background
pub struct RunningServer {
    local_addr: SocketAddr,
    engine: Arc<Engine>,
    hooks: ShutdownHooks,
    accept_loop: JoinHandle<Result<()>>,
    grace: Duration,
}

impl RunningServer {
    /// Actual bound address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.engine.metrics()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Token that, once cancelled, stops every accept and read loop.
    ///
    /// Cancelling it skips the shutdown hooks; call [`RunningServer::shutdown`]
    /// for the full sequence.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.engine.shutdown_token().clone()
    }

    /// Run hooks, close the listener and wait for in-flight handlers.
    ///
    /// Returns the accept loop's error, if it failed.
    pub async fn shutdown(self) -> Result<()> {
        info!(address = %self.local_addr, "Shutting down server");

        self.hooks.run().await;
        self.engine.shutdown_token().cancel();

        let accepted = match self.accept_loop.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "accept loop task failed");
                Err(ProtocolError::TransportError(e.to_string()))
            }
        };

        if !self.engine.drain(self.grace).await {
            warn!(in_flight = self.engine.in_flight(), "Shutdown finished with handlers still running");
        }
        self.engine.metrics().log_metrics();
        info!("Server shutdown complete");
        accepted
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn loopback_config(transport: TransportKind) -> NetworkConfig {
        NetworkConfig::default_with_overrides(|config| {
            config.server.address = "127.0.0.1:0".to_string();
            config.server.transport = transport;
            config.server.worker_capacity = 8;
            config.server.shutdown_grace = Duration::from_millis(200);
        })
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = NetworkConfig::default_with_overrides(|config| {
            config.server.worker_capacity = 0;
        });
        assert!(ServerBuilder::new(config).build().is_err());
    }

    #[test]
    fn test_build_rejects_quic_without_certificate() {
        let result = ServerBuilder::new(loopback_config(TransportKind::Quic)).build();
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_shutdown_runs_hooks_and_stops_accepting() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let server = ServerBuilder::new(loopback_config(TransportKind::Tcp))
            .with_default_middleware()
            .on_shutdown("mark", move || flag.store(true, Ordering::SeqCst))
            .build()
            .unwrap();

        let running = server.bind().await.unwrap();
        let addr = running.local_addr();
        assert_ne!(addr.port(), 0);

        running.shutdown().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_run_until_returns_after_signal() {
        let server = ServerBuilder::new(loopback_config(TransportKind::Udp))
            .build()
            .unwrap();
        let result = server
            .run_until(tokio::time::sleep(Duration::from_millis(20)))
            .await;
        assert!(result.is_ok());
    }
}
