//! # UDP Transport
//!
//! One shared, unconnected socket. Each datagram must be exactly one frame;
//! the peer address is the session key and the reply goes back to it.
//!
//! A datagram that fails to decode is logged, counted and dropped, and the
//! loop keeps reading. An idle socket is not an error: the read deadline only
//! bounds each wait so shutdown and idle logging stay responsive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

use crate::core::codec::PackCodec;
use crate::core::packet::MAX_DATAGRAM_SIZE;
use crate::error::Result;
use crate::protocol::context::ReplyChannel;
use crate::service::engine::Engine;

/// Replies to one remembered peer over the shared socket
pub struct UdpReply {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpReply {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl ReplyChannel for UdpReply {
    fn send<'a>(&'a self, frame: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.socket.send_to(&frame, self.peer).await?;
            Ok(())
        })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn transport(&self) -> &'static str {
        "udp"
    }
}

/// Shared-socket datagram server
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    engine: Arc<Engine>,
    codec: PackCodec,
    read_timeout: Duration,
}

impl UdpTransport {
    #[instrument(skip(engine))]
    pub async fn bind(addr: &str, engine: Arc<Engine>, read_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(address = %socket.local_addr()?, "UDP socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            engine,
            codec: PackCodec::datagram(),
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Read datagrams until shutdown
    pub async fn run(self) -> Result<()> {
        let shutdown = self.engine.shutdown_token().clone();
        let metrics = Arc::clone(self.engine.metrics());
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = tokio::time::timeout(self.read_timeout, self.socket.recv_from(&mut buf)) => received,
            };

            let (len, peer) = match received {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    // ICMP errors from earlier sends surface here; the socket stays usable
                    warn!(error = %e, "UDP receive failed");
                    continue;
                }
                Err(_) => {
                    debug!("UDP socket idle");
                    continue;
                }
            };

            let pack = match self.codec.decode_datagram(&buf[..len]) {
                Ok(pack) => pack,
                Err(e) => {
                    metrics.decode_error();
                    warn!(%peer, len, error = %e, "dropping undecodable datagram");
                    continue;
                }
            };

            let reply: Arc<dyn ReplyChannel> = Arc::new(UdpReply::new(Arc::clone(&self.socket), peer));
            let dispatched = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.engine.dispatch(pack, reply, self.codec) => res,
            };
            if let Err(e) = dispatched {
                warn!(%peer, error = %e, "UDP dispatch failed");
            }
        }

        info!("UDP socket closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{OpCode, Pack};
    use crate::protocol::dispatcher::Router;

    #[tokio::test]
    async fn test_udp_echo_and_bad_datagram() {
        let router = Router::builder()
            .handle(1000u16, |ctx| {
                Box::pin(async move {
                    let body = ctx.payload().to_vec();
                    let _ = ctx.write(body).await;
                })
            })
            .build();
        let engine = Arc::new(Engine::new(router, 4));
        let transport = UdpTransport::bind("127.0.0.1:0", Arc::clone(&engine), Duration::from_millis(50))
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let loop_handle = tokio::spawn(transport.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();

        // runt datagram is dropped and the loop keeps going
        client.send(&[0x00, 0x01]).await.unwrap();

        let codec = PackCodec::datagram();
        let mut request = Pack::new(OpCode(1000), 3, b"ping over udp".to_vec());
        client.send(&codec.encode(&mut request).unwrap()).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = codec.decode_datagram(&buf[..len]).unwrap();
        assert_eq!(reply.sequence_id(), 3);
        assert_eq!(reply.payload, b"ping over udp");
        assert_eq!(engine.metrics().snapshot().decode_errors, 1);

        engine.shutdown_token().cancel();
        loop_handle.await.unwrap().unwrap();
    }
}
