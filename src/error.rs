//! # Error Types
//!
//! Error handling for the opwire framework.
//!
//! This module defines every error variant that can occur while framing,
//! transporting and dispatching packs.
//!
//! ## Error Categories
//! - **Framing Errors**: packet too small, length mismatch, invalid payload length,
//!   short reads. Fatal to the current frame only.
//! - **Transport Errors**: I/O failures, deadlines, TLS/QUIC/DTLS failures. Fatal to
//!   the owning session.
//! - **Configuration Errors**: invalid or unreadable configuration.
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use opwire::core::codec::PackCodec;
//! use opwire::error::ProtocolError;
//! use tracing::warn;
//!
//! match PackCodec::datagram().decode_datagram(&[0x00, 0x01]) {
//!     Err(ProtocolError::PacketTooSmall { len }) => warn!(len, "dropping runt datagram"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

// ProtocolError is the primary error type for all framework operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Packet too small: {len} bytes (header is 12 bytes)")]
    PacketTooSmall { len: usize },

    #[error("Packet length mismatch: header declares {declared} bytes, got {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("Invalid payload length: declared total length {declared} is shorter than the header")]
    PayloadLengthError { declared: u32 },

    #[error("Short read: expected {expected} bytes, peer closed after {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Packet too large: {size} bytes (limit {limit})")]
    OversizedPacket { size: usize, limit: usize },

    #[error("Timeout occurred")]
    Timeout,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("QUIC error: {0}")]
    QuicError(String),

    #[error("DTLS error: {0}")]
    DtlsError(String),

    #[error("Failed to spawn task: {0}")]
    SpawnError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Framing errors only invalidate the frame they occurred in.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::PacketTooSmall { .. }
                | ProtocolError::LengthMismatch { .. }
                | ProtocolError::PayloadLengthError { .. }
                | ProtocolError::ShortRead { .. }
                | ProtocolError::OversizedPacket { .. }
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
