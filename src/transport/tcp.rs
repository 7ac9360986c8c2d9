//! # TCP Transport
//!
//! Stream sessions over TCP, optionally wrapped in TLS.
//!
//! The accept loop spawns one tracked task per connection. Each task reads
//! frames sequentially with the exact-length stream reader and dispatches them;
//! replies share the connection's write half. Responses to pipelined requests
//! may leave out of order, so peers correlate them by sequence id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::core::codec::{PackCodec, StreamFrames};
use crate::error::{ProtocolError, Result};
use crate::protocol::context::ReplyChannel;
use crate::service::engine::Engine;
use crate::transport::{serve_frames, SessionEnd, StreamReply};
use crate::utils::metrics::ConnectionGuard;
use crate::utils::timeout::{with_timeout_error, HANDSHAKE_TIMEOUT};

// Pause after a failed accept so descriptor exhaustion does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Bound TCP listener plus everything its sessions need
pub struct TcpTransport {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    engine: Arc<Engine>,
    codec: PackCodec,
    read_timeout: Duration,
    handshake_timeout: Duration,
}

impl TcpTransport {
    /// Bind `addr`. Passing a TLS acceptor makes every session TLS.
    #[instrument(skip(tls, engine))]
    pub async fn bind(
        addr: &str,
        tls: Option<TlsAcceptor>,
        engine: Arc<Engine>,
        read_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            address = %listener.local_addr()?,
            tls = tls.is_some(),
            "TCP listener bound"
        );
        Ok(Self {
            listener,
            tls,
            engine,
            codec: PackCodec::stream(),
            read_timeout,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    /// Deadline for the TLS handshake of each session
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Override the stream codec, e.g. to change the frame size cap
    pub fn with_codec(mut self, codec: PackCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept connections until shutdown. The listener closes when this returns.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.engine.shutdown_token().clone();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let engine = Arc::clone(&self.engine);
            let tls = self.tls.clone();
            let codec = self.codec;
            let timeouts = (self.handshake_timeout, self.read_timeout);
            self.engine.spawn(async move {
                if let Err(e) = serve_connection(engine, stream, peer, tls, codec, timeouts).await {
                    warn!(%peer, error = %e, "TCP session failed");
                }
            })?;
        }

        info!("TCP listener closed");
        Ok(())
    }
}

async fn serve_connection(
    engine: Arc<Engine>,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    codec: PackCodec,
    (handshake_timeout, read_timeout): (Duration, Duration),
) -> Result<()> {
    let _guard = ConnectionGuard::new(Arc::clone(engine.metrics()), "tcp");
    stream.set_nodelay(true)?;
    debug!(%peer, "TCP connection accepted");

    let end = match tls {
        Some(acceptor) => {
            let stream = with_timeout_error(
                async {
                    acceptor
                        .accept(stream)
                        .await
                        .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))
                },
                handshake_timeout,
            )
            .await?;
            serve_stream(&engine, stream, peer, codec, read_timeout).await
        }
        None => serve_stream(&engine, stream, peer, codec, read_timeout).await,
    };

    debug!(%peer, ?end, "TCP session ended");
    Ok(())
}

/// Run one stream session to completion over any byte stream
pub(crate) async fn serve_stream<S>(
    engine: &Engine,
    stream: S,
    peer: SocketAddr,
    codec: PackCodec,
    read_timeout: Duration,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reply: Arc<dyn ReplyChannel> = Arc::new(StreamReply::new(write_half, Some(peer)));
    let mut frames = StreamFrames::new(read_half, codec);
    serve_frames(engine, &mut frames, reply, codec, read_timeout).await
}
