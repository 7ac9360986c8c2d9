//! # QUIC Transport
//!
//! Multiplexed sessions over QUIC (quinn), always TLS 1.3.
//!
//! Each accepted connection gets one task. That task:
//! - spawns a datagram loop when unreliable datagrams are enabled, where every
//!   datagram is one frame and replies go back as datagrams;
//! - accepts bidirectional streams and serves each in its own task with the
//!   exact-length stream reader, so a stream may carry any number of frames
//!   and frames may arrive split across packets.
//!
//! A stream's send side is finished once the peer stops sending and every
//! handler holding its reply channel is done.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{
    ClientConfig, Connection, ConnectionError, Endpoint, IdleTimeout, Incoming, RecvStream,
    SendStream, TransportConfig, VarInt,
};
use tracing::{debug, info, instrument, warn};

use crate::config::QuicConfig;
use crate::core::codec::{PackCodec, StreamFrames};
use crate::error::{ProtocolError, Result};
use crate::protocol::context::{ReplyChannel, SessionInfo};
use crate::service::engine::Engine;
use crate::transport::tls::{TlsClientConfig, TlsServerConfig};
use crate::transport::{serve_frames, StreamReply};
use crate::utils::metrics::ConnectionGuard;
use crate::utils::timeout::with_timeout_error;

/// Flow-control unit; stream and connection windows are multiples of it
const BASE_WINDOW: u32 = 64 * 1024;

const DATAGRAM_BUFFER: usize = 1024 * 1024;

fn quic_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::QuicError(e.to_string())
}

/// Transport tuning shared by server and client endpoints
pub fn transport_config(quic: &QuicConfig) -> Result<TransportConfig> {
    let idle = IdleTimeout::try_from(quic.idle_timeout).map_err(quic_err)?;
    let mut transport = TransportConfig::default();
    transport
        .max_idle_timeout(Some(idle))
        .keep_alive_interval(Some(quic.keep_alive))
        .max_concurrent_bidi_streams(VarInt::from_u32(quic.max_streams))
        .max_concurrent_uni_streams(VarInt::from_u32(quic.max_streams))
        .stream_receive_window(VarInt::from_u32(BASE_WINDOW * 10))
        .receive_window(VarInt::from_u32(BASE_WINDOW * 100))
        .datagram_receive_buffer_size(quic.enable_datagrams.then_some(DATAGRAM_BUFFER));
    Ok(transport)
}

/// quinn server config from the certificate pair and QUIC tuning
pub fn build_server_config(tls: &TlsServerConfig, quic: &QuicConfig) -> Result<quinn::ServerConfig> {
    let crypto = tls.load_quic_server_config(quic.allow_0rtt)?;
    let crypto = QuicServerConfig::try_from(crypto).map_err(quic_err)?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(quic)?));
    Ok(config)
}

/// quinn client config trusting the roots in `tls`
pub fn build_client_config(tls: &TlsClientConfig, quic: &QuicConfig) -> Result<ClientConfig> {
    let crypto = tls.load_quic_client_config()?;
    let crypto = QuicClientConfig::try_from(crypto).map_err(quic_err)?;
    let mut config = ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(quic)?));
    Ok(config)
}

/// Open a client connection to a QUIC server.
///
/// The endpoint is returned as well; dropping it tears the connection down.
#[instrument(skip(tls, quic))]
pub async fn connect(
    addr: SocketAddr,
    tls: &TlsClientConfig,
    quic: &QuicConfig,
) -> Result<(Endpoint, Connection)> {
    let bind: SocketAddr = if addr.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(build_client_config(tls, quic)?);

    let connecting = endpoint
        .connect(addr, tls.server_name_str())
        .map_err(quic_err)?;
    let connection = with_timeout_error(
        async { connecting.await.map_err(quic_err) },
        quic.handshake_timeout,
    )
    .await?;
    debug!(remote = %connection.remote_address(), "QUIC connection established");
    Ok((endpoint, connection))
}

/// Connection-level part of [`SessionInfo`]
fn connection_info(connection: &Connection, early_data: bool) -> SessionInfo {
    let handshake = connection
        .handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok());
    SessionInfo {
        stream_id: None,
        alpn: handshake.as_ref().and_then(|h| h.protocol.clone()),
        server_name: handshake.and_then(|h| h.server_name),
        early_data,
    }
}

/// Sends replies as unreliable datagrams on the connection
struct DatagramReply {
    connection: Connection,
    info: SessionInfo,
}

impl ReplyChannel for DatagramReply {
    fn send<'a>(&'a self, frame: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.connection.send_datagram(frame).map_err(quic_err) })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.connection.remote_address())
    }

    fn session_info(&self) -> Option<&SessionInfo> {
        Some(&self.info)
    }

    fn transport(&self) -> &'static str {
        "quic"
    }
}

/// Stream reply that finishes the send side once the last holder lets go
struct QuicStreamReply {
    inner: StreamReply<SendStream>,
    info: SessionInfo,
}

impl ReplyChannel for QuicStreamReply {
    fn send<'a>(&'a self, frame: Bytes) -> BoxFuture<'a, Result<()>> {
        self.inner.send(frame)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    fn session_info(&self) -> Option<&SessionInfo> {
        Some(&self.info)
    }

    fn transport(&self) -> &'static str {
        "quic"
    }
}

impl Drop for QuicStreamReply {
    fn drop(&mut self) {
        // Already reset or finished by the peer side
        let _ = self.inner.writer.get_mut().finish();
    }
}

/// QUIC server endpoint
pub struct QuicTransport {
    endpoint: Endpoint,
    engine: Arc<Engine>,
    quic: QuicConfig,
    read_timeout: Duration,
}

impl QuicTransport {
    #[instrument(skip(tls, quic, engine))]
    pub fn bind(
        addr: SocketAddr,
        tls: &TlsServerConfig,
        quic: &QuicConfig,
        engine: Arc<Engine>,
        read_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Endpoint::server(build_server_config(tls, quic)?, addr)?;
        info!(
            address = %endpoint.local_addr()?,
            datagrams = quic.enable_datagrams,
            allow_0rtt = quic.allow_0rtt,
            "QUIC endpoint bound"
        );
        Ok(Self {
            endpoint,
            engine,
            quic: quic.clone(),
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept connections until shutdown, then close the endpoint
    pub async fn run(self) -> Result<()> {
        let shutdown = self.engine.shutdown_token().clone();

        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = self.endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                debug!("QUIC endpoint stopped accepting");
                break;
            };

            let engine = Arc::clone(&self.engine);
            let quic = self.quic.clone();
            let read_timeout = self.read_timeout;
            let remote = incoming.remote_address();
            self.engine.spawn(async move {
                if let Err(e) = serve_connection(engine, incoming, quic, read_timeout).await {
                    warn!(%remote, error = %e, "QUIC connection failed");
                }
            })?;
        }

        self.endpoint.close(VarInt::from_u32(0), b"server shutdown");
        info!("QUIC endpoint closed");
        Ok(())
    }
}

/// Complete the handshake; the flag is set when 0-RTT was taken
async fn handshake(incoming: Incoming, quic: &QuicConfig) -> Result<(Connection, bool)> {
    let connecting = incoming.accept().map_err(quic_err)?;
    if quic.allow_0rtt {
        match connecting.into_0rtt() {
            Ok((connection, _accepted)) => return Ok((connection, true)),
            Err(connecting) => return Ok((connecting.await.map_err(quic_err)?, false)),
        }
    }
    Ok((connecting.await.map_err(quic_err)?, false))
}

async fn serve_connection(
    engine: Arc<Engine>,
    incoming: Incoming,
    quic: QuicConfig,
    read_timeout: Duration,
) -> Result<()> {
    let (connection, early_data) =
        with_timeout_error(handshake(incoming, &quic), quic.handshake_timeout).await?;
    let _guard = ConnectionGuard::new(Arc::clone(engine.metrics()), "quic");
    let remote = connection.remote_address();
    let info = connection_info(&connection, early_data);
    debug!(%remote, early_data, server_name = ?info.server_name, "QUIC connection accepted");

    if quic.enable_datagrams {
        let engine_ref = Arc::clone(&engine);
        let connection = connection.clone();
        engine.spawn(serve_datagrams(engine_ref, connection, info.clone()))?;
    }

    let shutdown = engine.shutdown_token().clone();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = connection.accept_bi() => accepted,
        };

        match accepted {
            Ok((send, recv)) => {
                let engine_ref = Arc::clone(&engine);
                let info = SessionInfo {
                    stream_id: Some(VarInt::from(send.id()).into_inner()),
                    ..info.clone()
                };
                engine.spawn(serve_stream(engine_ref, send, recv, remote, info, read_timeout))?;
            }
            Err(e) => {
                log_connection_end(remote, &e);
                break;
            }
        }
    }
    Ok(())
}

fn log_connection_end(remote: SocketAddr, error: &ConnectionError) {
    match error {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed
        | ConnectionError::TimedOut => debug!(%remote, reason = %error, "QUIC connection ended"),
        _ => warn!(%remote, error = %error, "QUIC connection lost"),
    }
}

async fn serve_stream(
    engine: Arc<Engine>,
    send: SendStream,
    recv: RecvStream,
    remote: SocketAddr,
    info: SessionInfo,
    read_timeout: Duration,
) {
    let codec = PackCodec::stream();
    let stream_id = info.stream_id;
    let reply: Arc<dyn ReplyChannel> = Arc::new(QuicStreamReply {
        inner: StreamReply::new(send, Some(remote)),
        info,
    });
    let mut frames = StreamFrames::new(recv, codec);
    let end = serve_frames(&engine, &mut frames, reply, codec, read_timeout).await;
    debug!(%remote, ?stream_id, ?end, "QUIC stream ended");
}

async fn serve_datagrams(engine: Arc<Engine>, connection: Connection, info: SessionInfo) {
    let codec = PackCodec::datagram();
    let shutdown = engine.shutdown_token().clone();
    let remote = connection.remote_address();
    let reply: Arc<dyn ReplyChannel> = Arc::new(DatagramReply {
        connection: connection.clone(),
        info,
    });

    loop {
        let datagram = tokio::select! {
            _ = shutdown.cancelled() => break,
            datagram = connection.read_datagram() => datagram,
        };

        let bytes = match datagram {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(%remote, reason = %e, "QUIC datagram loop ended");
                break;
            }
        };

        let pack = match codec.decode_datagram(&bytes) {
            Ok(pack) => pack,
            Err(e) => {
                engine.metrics().decode_error();
                warn!(%remote, len = bytes.len(), error = %e, "dropping undecodable QUIC datagram");
                continue;
            }
        };

        let dispatched = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = engine.dispatch(pack, Arc::clone(&reply), codec) => res,
        };
        if let Err(e) = dispatched {
            warn!(%remote, error = %e, "QUIC datagram dispatch failed");
        }
    }
}
