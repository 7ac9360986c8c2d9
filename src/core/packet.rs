//! # Pack
//!
//! One framed protocol message: a fixed 12-byte big-endian header followed by
//! an opaque payload.
//!
//! ```text
//! [Length(4)] [SequenceId(4)] [OpCode(2)] [Version(2)] [Payload(Length - 12)]
//! ```
//!
//! `Length` always covers header plus payload. Encoders recompute it from the
//! payload, so callers never have to fill it in.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 12;

/// Largest datagram a UDP socket can carry (65535 - 8 byte UDP header - 20 byte IP header)
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Protocol version written by the bundled clients
pub const PROTOCOL_VERSION: u16 = 1;

/// Operation code selecting the handler for a pack.
///
/// Codes below [`OpCode::APP_MIN`] are reserved for the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct OpCode(pub u16);

impl OpCode {
    /// Success / acknowledgement
    pub const OK: OpCode = OpCode(0);
    /// Server-side failure
    pub const SERVER_ERROR: OpCode = OpCode(1);
    /// Liveness probe
    pub const PING: OpCode = OpCode(2);
    /// Reply to [`OpCode::PING`]
    pub const PONG: OpCode = OpCode(3);
    /// No handler registered for the requested code
    pub const NOT_FOUND: OpCode = OpCode(4);
    /// First code available to applications
    pub const APP_MIN: OpCode = OpCode(1000);

    /// Whether this code falls in the framework-reserved range
    pub fn is_reserved(self) -> bool {
        self < Self::APP_MIN
    }
}

impl From<u16> for OpCode {
    fn from(value: u16) -> Self {
        OpCode(value)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-size header preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackHead {
    /// Total encoded size including the header
    pub len: u32,
    /// Caller-assigned correlation id, opaque to the framework
    pub sequence_id: u32,
    pub op_code: OpCode,
    pub version: u16,
}

impl PackHead {
    /// Parse the header layout shared by every transport.
    ///
    /// The declared length is not validated here; each framing adapter checks it
    /// against what it can actually read.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::PacketTooSmall { len: bytes.len() });
        }

        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let sequence_id = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let op_code = u16::from_be_bytes([bytes[8], bytes[9]]);
        let version = u16::from_be_bytes([bytes[10], bytes[11]]);

        Ok(Self {
            len,
            sequence_id,
            op_code: OpCode(op_code),
            version,
        })
    }

    /// Number of payload bytes that follow the header
    pub fn payload_len(&self) -> Result<usize> {
        (self.len as usize)
            .checked_sub(HEADER_LEN)
            .ok_or(ProtocolError::PayloadLengthError { declared: self.len })
    }

    pub(crate) fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u32(self.len);
        dst.put_u32(self.sequence_id);
        dst.put_u16(self.op_code.0);
        dst.put_u16(self.version);
    }
}

/// One message unit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pack {
    pub head: PackHead,
    pub payload: Vec<u8>,
}

impl Pack {
    /// Build a pack ready for encoding; length is filled in by the codec
    pub fn new(op_code: OpCode, sequence_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            head: PackHead {
                len: 0,
                sequence_id,
                op_code,
                version: PROTOCOL_VERSION,
            },
            payload: payload.into(),
        }
    }

    /// Total encoded size for the current payload
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    #[inline]
    pub fn sequence_id(&self) -> u32 {
        self.head.sequence_id
    }

    #[inline]
    pub fn op_code(&self) -> OpCode {
        self.head.op_code
    }

    #[inline]
    pub fn version(&self) -> u16 {
        self.head.version
    }
}
