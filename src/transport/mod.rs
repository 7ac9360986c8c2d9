//! # Transport Layer
//!
//! Connection and session managers, one per socket model:
//!
//! - [`tcp`]: one task per accepted connection, optionally TLS-wrapped
//! - [`udp`]: one shared socket, every datagram a self-contained frame
//! - [`dtls`]: secured datagram sessions (feature `dtls`)
//! - [`quic`]: one task per connection, one per bidirectional stream, plus an
//!   unreliable datagram loop
//!
//! All of them turn bytes into [`Pack`]s through a [`FrameSource`] and hand
//! each one to [`Engine::dispatch`] with a transport-specific
//! [`ReplyChannel`]. The read loop itself lives here in [`serve_frames`].
//!
//! [`Pack`]: crate::core::packet::Pack

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::codec::{FrameSource, PackCodec};
use crate::error::Result;
use crate::protocol::context::ReplyChannel;
use crate::service::engine::Engine;

#[cfg(feature = "dtls")]
pub mod dtls;
pub mod quic;
pub mod tcp;
pub mod tls;
pub mod udp;

/// Reply channel over the write half of a byte stream.
///
/// Concurrent handlers on the same connection serialize on the lock, so
/// whole frames are never interleaved.
pub struct StreamReply<W> {
    writer: Mutex<W>,
    peer: Option<SocketAddr>,
}

impl<W> StreamReply<W> {
    pub fn new(writer: W, peer: Option<SocketAddr>) -> Self {
        Self {
            writer: Mutex::new(writer),
            peer,
        }
    }
}

impl<W> ReplyChannel for StreamReply<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send<'a>(&'a self, frame: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn transport(&self) -> &'static str {
        "tcp"
    }
}

/// Why a session read loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed at a frame boundary
    Closed,
    /// Server-wide shutdown was signalled
    Shutdown,
    /// No frame arrived within the read deadline
    IdleTimeout,
    /// Framing error on a source that cannot resynchronize
    Framing,
    /// I/O or transport failure
    Transport,
}

/// Read frames from `frames` and dispatch each one until the session ends.
///
/// Every read is bounded by `read_timeout`. Framing errors are logged and
/// counted; record-oriented sources skip the bad frame, byte streams end the
/// session. Dispatch blocks while the governor is exhausted, so a saturated
/// server stops reading from the peer.
pub async fn serve_frames<S>(
    engine: &Engine,
    frames: &mut S,
    reply: Arc<dyn ReplyChannel>,
    codec: PackCodec,
    read_timeout: Duration,
) -> SessionEnd
where
    S: FrameSource + ?Sized,
{
    let shutdown = engine.shutdown_token().clone();
    let peer = reply.peer_addr();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return SessionEnd::Shutdown,
            next = tokio::time::timeout(read_timeout, frames.next_frame()) => next,
        };

        let pack = match next {
            Ok(Ok(Some(pack))) => pack,
            Ok(Ok(None)) => {
                debug!(?peer, "peer closed session");
                return SessionEnd::Closed;
            }
            Ok(Err(e)) if e.is_framing() => {
                engine.metrics().decode_error();
                warn!(?peer, error = %e, "frame decode failed");
                if frames.can_resync() {
                    continue;
                }
                return SessionEnd::Framing;
            }
            Ok(Err(e)) => {
                warn!(?peer, error = %e, "session read failed");
                return SessionEnd::Transport;
            }
            Err(_) => {
                warn!(?peer, timeout_ms = read_timeout.as_millis() as u64, "read deadline exceeded");
                return SessionEnd::IdleTimeout;
            }
        };

        let dispatched = tokio::select! {
            _ = shutdown.cancelled() => return SessionEnd::Shutdown,
            res = engine.dispatch(pack, Arc::clone(&reply), codec) => res,
        };
        if let Err(e) = dispatched {
            warn!(?peer, error = %e, "dispatch failed");
            return SessionEnd::Transport;
        }
    }
}
