//! # DTLS Transport
//!
//! Secured datagram sessions built on the webrtc-rs DTLS stack.
//!
//! A UDP listener demultiplexes peers; each new peer gets its own task that
//! completes the DTLS handshake (bounded by the handshake timeout) and then
//! reads records. Every record carries exactly one frame, so a bad record is
//! dropped and the session keeps reading.
//!
//! Requires the `dtls` feature.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, info, instrument, warn};
use webrtc_dtls::config::{Config, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_dtls::crypto::Certificate;
use webrtc_util::conn::conn_udp_listener;
use webrtc_util::conn::{Conn, Listener};

use crate::core::codec::{FrameSource, PackCodec};
use crate::core::packet::{Pack, MAX_DATAGRAM_SIZE};
use crate::error::{ProtocolError, Result};
use crate::protocol::context::ReplyChannel;
use crate::service::engine::Engine;
use crate::transport::serve_frames;
use crate::transport::tls::TlsServerConfig;
use crate::utils::metrics::ConnectionGuard;
use crate::utils::timeout::{with_timeout_error, HANDSHAKE_TIMEOUT};

fn dtls_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::DtlsError(e.to_string())
}

/// Build a DTLS server config from the PEM pair on disk.
///
/// The webrtc stack expects the PKCS#8 key first, tagged `PRIVATE_KEY`,
/// followed by the certificate chain.
pub fn load_server_config(tls: &TlsServerConfig) -> Result<Config> {
    let (cert_pem, key_pem) = tls.read_pem()?;
    let bundle = format!("{}\n{}", key_pem.replace("PRIVATE KEY", "PRIVATE_KEY"), cert_pem);
    let certificate = Certificate::from_pem(&bundle).map_err(dtls_err)?;

    Ok(Config {
        certificates: vec![certificate],
        extended_master_secret: ExtendedMasterSecretType::Require,
        ..Default::default()
    })
}

/// Reads one DTLS record per frame
struct RecordFrames {
    conn: Arc<DTLSConn>,
    buf: Vec<u8>,
    codec: PackCodec,
}

impl FrameSource for RecordFrames {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Pack>>> {
        Box::pin(async move {
            let len = self.conn.recv(&mut self.buf).await.map_err(dtls_err)?;
            self.codec.decode_datagram(&self.buf[..len]).map(Some)
        })
    }

    fn can_resync(&self) -> bool {
        true
    }
}

struct DtlsReply {
    conn: Arc<DTLSConn>,
    peer: SocketAddr,
}

impl ReplyChannel for DtlsReply {
    fn send<'a>(&'a self, frame: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.conn.send(&frame).await.map_err(dtls_err)?;
            Ok(())
        })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn transport(&self) -> &'static str {
        "dtls"
    }
}

/// DTLS-secured datagram server
pub struct DtlsTransport {
    listener: Arc<dyn Listener + Send + Sync>,
    config: Config,
    local_addr: SocketAddr,
    engine: Arc<Engine>,
    read_timeout: Duration,
    handshake_timeout: Duration,
}

impl DtlsTransport {
    #[instrument(skip(tls, engine))]
    pub async fn bind(
        addr: &str,
        tls: &TlsServerConfig,
        engine: Arc<Engine>,
        read_timeout: Duration,
    ) -> Result<Self> {
        let config = load_server_config(tls)?;
        let listener = conn_udp_listener::listen(addr.to_string()).await.map_err(dtls_err)?;
        let local_addr = listener.addr().await.map_err(dtls_err)?;
        info!(address = %local_addr, "DTLS listener bound");

        Ok(Self {
            listener: Arc::new(listener),
            config,
            local_addr,
            engine,
            read_timeout,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    /// Deadline for each peer's DTLS handshake
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept peers until shutdown, then close the listener
    pub async fn run(self) -> Result<()> {
        let shutdown = self.engine.shutdown_token().clone();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (conn, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "DTLS accept failed");
                    break;
                }
            };

            let engine = Arc::clone(&self.engine);
            let config = self.config.clone();
            let timeouts = (self.handshake_timeout, self.read_timeout);
            self.engine.spawn(async move {
                if let Err(e) = serve_session(engine, conn, peer, config, timeouts).await {
                    warn!(%peer, error = %e, "DTLS session failed");
                }
            })?;
        }

        if let Err(e) = self.listener.close().await {
            debug!(error = %e, "DTLS listener close");
        }
        info!("DTLS listener closed");
        Ok(())
    }
}

async fn serve_session(
    engine: Arc<Engine>,
    conn: Arc<dyn Conn + Send + Sync>,
    peer: SocketAddr,
    config: Config,
    (handshake_timeout, read_timeout): (Duration, Duration),
) -> Result<()> {
    let _guard = ConnectionGuard::new(Arc::clone(engine.metrics()), "dtls");

    let dtls = with_timeout_error(
        async { DTLSConn::new(conn, config, false, None).await.map_err(dtls_err) },
        handshake_timeout,
    )
    .await?;
    let dtls = Arc::new(dtls);
    debug!(%peer, "DTLS handshake complete");

    let codec = PackCodec::datagram();
    let reply: Arc<dyn ReplyChannel> = Arc::new(DtlsReply {
        conn: Arc::clone(&dtls),
        peer,
    });
    let mut frames = RecordFrames {
        conn: Arc::clone(&dtls),
        buf: vec![0u8; MAX_DATAGRAM_SIZE],
        codec,
    };

    let end = serve_frames(&engine, &mut frames, reply, codec, read_timeout).await;
    debug!(%peer, ?end, "DTLS session ended");

    if let Err(e) = dtls.close().await {
        debug!(%peer, error = %e, "DTLS close");
    }
    Ok(())
}
