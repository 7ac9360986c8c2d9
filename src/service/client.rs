//! # Clients
//!
//! Minimal request/response clients for the TCP (optionally TLS) and UDP
//! transports. Each client numbers its requests with a monotonically
//! increasing sequence id and matches replies on it.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio_rustls::client::TlsStream;
use tracing::{debug, instrument};

use crate::core::codec::PackCodec;
use crate::core::packet::{OpCode, Pack, MAX_DATAGRAM_SIZE};
use crate::error::{ProtocolError, Result};
use crate::transport::tls::{self, TlsClientConfig};
use crate::utils::timeout::with_timeout_error;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client over any byte stream; [`TcpClient::connect`] and
/// [`TcpClient::connect_tls`] build the usual ones.
pub struct TcpClient<S = TcpStream> {
    stream: S,
    codec: PackCodec,
    next_sequence: u32,
    timeout: Duration,
}

impl TcpClient<TcpStream> {
    #[instrument]
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }
}

impl TcpClient<TlsStream<TcpStream>> {
    pub async fn connect_tls(addr: &str, config: &TlsClientConfig) -> Result<Self> {
        Ok(Self::from_stream(tls::connect(addr, config).await?))
    }
}

impl<S> TcpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            codec: PackCodec::stream(),
            next_sequence: 1,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Deadline for each [`TcpClient::request`]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Write one request frame and return its sequence id
    pub async fn send(&mut self, op_code: OpCode, payload: impl Into<Vec<u8>>) -> Result<u32> {
        let sequence_id = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let mut pack = Pack::new(op_code, sequence_id, payload);
        let frame = self.codec.encode(&mut pack)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(sequence_id)
    }

    /// Read the next frame from the server, whatever it answers
    pub async fn recv(&mut self) -> Result<Pack> {
        self.codec
            .read_frame(&mut self.stream)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Send a request and wait for the reply carrying its sequence id.
    ///
    /// Frames for other sequence ids (late replies to earlier requests) are
    /// skipped.
    pub async fn request(&mut self, op_code: OpCode, payload: impl Into<Vec<u8>>) -> Result<Pack> {
        let sequence_id = self.send(op_code, payload).await?;
        let timeout = self.timeout;
        with_timeout_error(
            async {
                loop {
                    let pack = self.recv().await?;
                    if pack.sequence_id() == sequence_id {
                        return Ok(pack);
                    }
                    debug!(expected = sequence_id, got = pack.sequence_id(), "skipping unmatched reply");
                }
            },
            timeout,
        )
        .await
    }

    pub async fn ping(&mut self) -> Result<Pack> {
        self.request(OpCode::PING, Vec::new()).await
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Client bound to one UDP server address
pub struct UdpClient {
    socket: UdpSocket,
    codec: PackCodec,
    next_sequence: u32,
    timeout: Duration,
}

impl UdpClient {
    #[instrument(skip(addr))]
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let server = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| ProtocolError::TransportError("address resolved to nothing".into()))?;
        let local: SocketAddr = if server.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        Ok(Self {
            socket,
            codec: PackCodec::datagram(),
            next_sequence: 1,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Deadline for each reply; datagrams may be lost, so keep it short
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send(&mut self, op_code: OpCode, payload: impl Into<Vec<u8>>) -> Result<u32> {
        let sequence_id = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let mut pack = Pack::new(op_code, sequence_id, payload);
        let frame = self.codec.encode(&mut pack)?;
        self.socket.send(&frame).await?;
        Ok(sequence_id)
    }

    pub async fn recv(&self) -> Result<Pack> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let len = self.socket.recv(&mut buf).await?;
        self.codec.decode_datagram(&buf[..len])
    }

    /// Send a request and wait for its reply; no retransmission
    pub async fn request(&mut self, op_code: OpCode, payload: impl Into<Vec<u8>>) -> Result<Pack> {
        let sequence_id = self.send(op_code, payload).await?;
        with_timeout_error(
            async {
                loop {
                    let pack = self.recv().await?;
                    if pack.sequence_id() == sequence_id {
                        return Ok(pack);
                    }
                    debug!(expected = sequence_id, got = pack.sequence_id(), "skipping unmatched reply");
                }
            },
            self.timeout,
        )
        .await
    }
}
