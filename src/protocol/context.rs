//! # Request Context
//!
//! One [`Context`] carries one decoded pack through the handler chain.
//!
//! The context owns the pipeline cursor and abort flag, the pack itself and a
//! [`ReplyChannel`] bound by the transport that read the pack. Handlers reply
//! through [`Context::write`] and friends; the reply copies the request's
//! sequence id and version so the peer can correlate it.
//!
//! ## Pipeline
//! [`Context::next`] runs exactly the next handler of the chain, and only while
//! the context is not aborted. A middleware that wants the rest of the chain to
//! run awaits `ctx.next()`; one that returns without doing so ends the chain.
//!
//! ```rust,no_run
//! use opwire::protocol::Context;
//! use futures::future::BoxFuture;
//!
//! fn auth(ctx: &mut Context) -> BoxFuture<'_, ()> {
//!     Box::pin(async move {
//!         if ctx.payload().is_empty() {
//!             let _ = ctx.server_error().await;
//!             ctx.abort();
//!             return;
//!         }
//!         ctx.next().await;
//!     })
//! }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::core::codec::PackCodec;
use crate::core::packet::{OpCode, Pack, PackHead};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Chain;
use crate::utils::metrics::Metrics;

/// Transport-specific way of sending an encoded frame back to the peer.
///
/// Stream transports write to the open connection or sub-stream; datagram
/// transports send to the remembered peer address.
pub trait ReplyChannel: Send + Sync {
    fn send<'a>(&'a self, frame: Bytes) -> BoxFuture<'a, Result<()>>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Label of the transport carrying the session; selects the context pool
    fn transport(&self) -> &'static str {
        "local"
    }

    /// Details of the multiplexed session the pack arrived on, if any
    fn session_info(&self) -> Option<&SessionInfo> {
        None
    }
}

/// What a QUIC connection and sub-stream tell a handler about themselves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Sub-stream the pack arrived on; `None` for connection datagrams
    pub stream_id: Option<u64>,
    /// Negotiated ALPN protocol
    pub alpn: Option<Vec<u8>>,
    /// Server name the client sent (SNI)
    pub server_name: Option<String>,
    /// Accepted with 0-RTT enabled
    pub early_data: bool,
}

/// Per-message processing state
pub struct Context {
    position: usize,
    aborted: bool,
    chain: Option<Chain>,
    reply: Option<Arc<dyn ReplyChannel>>,
    codec: PackCodec,
    pack: Pack,
    metrics: Option<Arc<Metrics>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            position: 0,
            aborted: false,
            chain: None,
            reply: None,
            codec: PackCodec::stream(),
            pack: Pack::default(),
            metrics: None,
        }
    }

    /// Bind a freshly decoded pack, its reply channel and the chain to run.
    pub(crate) fn prepare(
        &mut self,
        pack: Pack,
        reply: Arc<dyn ReplyChannel>,
        codec: PackCodec,
        chain: Chain,
        metrics: Option<Arc<Metrics>>,
    ) {
        self.reset();
        self.pack = pack;
        self.reply = Some(reply);
        self.codec = codec;
        self.chain = Some(chain);
        self.metrics = metrics;
    }

    /// Clear everything tied to the previous message
    pub fn reset(&mut self) {
        self.position = 0;
        self.aborted = false;
        self.chain = None;
        self.reply = None;
        self.pack = Pack::default();
        self.metrics = None;
    }

    /// Run the next handler in the chain, if any and if not aborted.
    pub async fn next(&mut self) {
        if self.aborted {
            return;
        }
        let handler = match self.chain.as_ref().and_then(|c| c.get(self.position)) {
            Some(handler) => Arc::clone(handler),
            None => return,
        };
        self.position += 1;
        handler.call(self).await;
    }

    /// Stop the chain; handlers after the current one never run.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Reply with [`OpCode::OK`]
    pub async fn write(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.write_with_op_code(OpCode::OK, payload).await
    }

    /// Reply with an explicit op code
    pub async fn write_with_op_code(
        &self,
        op_code: OpCode,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let reply = self.reply.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let mut response = Pack {
            head: PackHead {
                len: 0,
                sequence_id: self.pack.head.sequence_id,
                op_code,
                version: self.pack.head.version,
            },
            payload: payload.into(),
        };
        let frame = self.codec.encode(&mut response)?;
        let frame_len = frame.len() as u64;

        let result = reply.send(frame).await;
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(()) => metrics.frame_sent(frame_len),
                Err(_) => metrics.write_error(),
            }
        }
        result
    }

    /// Empty-payload [`OpCode::SERVER_ERROR`] reply
    pub async fn server_error(&self) -> Result<()> {
        self.write_with_op_code(OpCode::SERVER_ERROR, Vec::new()).await
    }

    /// Empty-payload [`OpCode::NOT_FOUND`] reply
    pub async fn not_found(&self) -> Result<()> {
        self.write_with_op_code(OpCode::NOT_FOUND, Vec::new()).await
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.reply.as_ref().and_then(|r| r.peer_addr())
    }

    /// Stream id and connection state on QUIC; `None` on other transports
    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.reply.as_deref().and_then(|r| r.session_info())
    }

    /// Counters of the engine that dispatched this context
    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_deref()
    }

    pub fn pack(&self) -> &Pack {
        &self.pack
    }

    #[inline]
    pub fn sequence_id(&self) -> u32 {
        self.pack.head.sequence_id
    }

    #[inline]
    pub fn op_code(&self) -> OpCode {
        self.pack.head.op_code
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.pack.payload
    }

    /// Take the payload out, leaving it empty
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pack.payload)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("position", &self.position)
            .field("aborted", &self.aborted)
            .field("op_code", &self.pack.head.op_code)
            .field("sequence_id", &self.pack.head.sequence_id)
            .field("payload_len", &self.pack.payload.len())
            .field("peer", &self.peer_addr())
            .finish()
    }
}
