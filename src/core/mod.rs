//! # Core Protocol Components
//!
//! Pack model and framing shared by every transport.
//!
//! ## Components
//! - **Packet**: `Pack`, `PackHead` and the reserved `OpCode` values
//! - **Codec**: stream and datagram framing, plus the `FrameSource` adapter trait
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [SequenceId(4)] [OpCode(2)] [Version(2)] [Payload(Length - 12)]
//! ```
//! All integers are big-endian.
//!
//! ## Security
//! - Datagram frames never exceed 65507 bytes
//! - Stream frames are capped (16MB by default) before any payload is read

pub mod codec;
pub mod packet;

pub use codec::{FrameSource, PackCodec, StreamFrames};
pub use packet::{OpCode, Pack, PackHead, HEADER_LEN, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
