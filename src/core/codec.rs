//! # Pack Codec
//!
//! Framing for [`Pack`] over byte streams and datagrams.
//!
//! One header layout ([`PackHead::parse`]) is shared by three thin adapters:
//! - **Stream**: `tokio_util` [`Decoder`]/[`Encoder`] for buffered sinks and
//!   [`PackCodec::read_frame`] for reading exactly one frame off an `AsyncRead`.
//! - **Datagram**: [`PackCodec::decode_datagram`], where one datagram must be
//!   exactly one frame.
//! - **Secure datagram**: lives next to the DTLS transport and implements
//!   [`FrameSource`] on top of `decode_datagram`.
//!
//! A codec value is `Copy` and holds no per-connection state, so one instance is
//! shared by every task.
//!
//! ## Security
//! - Stream frames are capped at 16MB by default to bound allocation.
//! - Payload buffers grow with the bytes actually received, not with the
//!   declared length.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::{Pack, PackHead, HEADER_LEN, MAX_DATAGRAM_SIZE};
use crate::error::{ProtocolError, Result};

/// Default ceiling for stream frames (16MB)
pub const MAX_STREAM_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Stateless pack encoder/decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackCodec {
    max_frame_len: usize,
}

impl PackCodec {
    /// Codec for TCP, TLS and QUIC streams
    pub const fn stream() -> Self {
        Self {
            max_frame_len: MAX_STREAM_FRAME_SIZE,
        }
    }

    /// Codec for UDP and DTLS datagrams, limited to [`MAX_DATAGRAM_SIZE`]
    pub const fn datagram() -> Self {
        Self {
            max_frame_len: MAX_DATAGRAM_SIZE,
        }
    }

    /// Override the frame ceiling
    pub const fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encode a pack into a fresh buffer.
    ///
    /// The header length is recomputed from the payload and written back into
    /// `pack`, so the caller sees what went on the wire.
    pub fn encode(&self, pack: &mut Pack) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(pack.encoded_len());
        self.encode_into(pack, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode a pack, appending to `dst`
    pub fn encode_into(&self, pack: &mut Pack, dst: &mut BytesMut) -> Result<()> {
        let total = pack.encoded_len();
        if total > self.max_frame_len {
            return Err(ProtocolError::OversizedPacket {
                size: total,
                limit: self.max_frame_len,
            });
        }

        pack.head.len = u32::try_from(total).map_err(|_| ProtocolError::OversizedPacket {
            size: total,
            limit: u32::MAX as usize,
        })?;
        // An op code left at zero already is OpCode::OK on the wire.

        dst.reserve(total);
        pack.head.write_to(dst);
        dst.extend_from_slice(&pack.payload);
        Ok(())
    }

    /// Decode one datagram as exactly one frame.
    pub fn decode_datagram(&self, data: &[u8]) -> Result<Pack> {
        let head = PackHead::parse(data)?;
        head.payload_len()?;

        if head.len as usize != data.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: head.len,
                actual: data.len(),
            });
        }

        if data.len() > self.max_frame_len {
            return Err(ProtocolError::OversizedPacket {
                size: data.len(),
                limit: self.max_frame_len,
            });
        }

        Ok(Pack {
            head,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }

    /// Read exactly one frame from a byte stream.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly before sending any byte of
    /// a new frame, and [`ProtocolError::ShortRead`] when it closed mid-frame.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Pack>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::ShortRead {
                    expected: HEADER_LEN,
                    received: filled,
                });
            }
            filled += n;
        }

        let head = PackHead::parse(&header)?;
        let payload_len = self.checked_payload_len(&head)?;

        let mut payload = Vec::with_capacity(payload_len.min(64 * 1024));
        let mut limited = (&mut *reader).take(payload_len as u64);
        limited.read_to_end(&mut payload).await?;
        if payload.len() < payload_len {
            return Err(ProtocolError::ShortRead {
                expected: head.len as usize,
                received: HEADER_LEN + payload.len(),
            });
        }

        Ok(Some(Pack { head, payload }))
    }

    fn checked_payload_len(&self, head: &PackHead) -> Result<usize> {
        let payload_len = head.payload_len()?;
        if head.len as usize > self.max_frame_len {
            return Err(ProtocolError::OversizedPacket {
                size: head.len as usize,
                limit: self.max_frame_len,
            });
        }
        Ok(payload_len)
    }
}

impl Default for PackCodec {
    fn default() -> Self {
        Self::stream()
    }
}

impl Encoder<Pack> for PackCodec {
    type Error = ProtocolError;

    fn encode(&mut self, mut item: Pack, dst: &mut BytesMut) -> Result<()> {
        self.encode_into(&mut item, dst)
    }
}

impl Decoder for PackCodec {
    type Item = Pack;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Pack>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let head = PackHead::parse(&src[..HEADER_LEN])?;
        self.checked_payload_len(&head)?;

        let total = head.len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        Ok(Some(Pack {
            head,
            payload: frame[HEADER_LEN..].to_vec(),
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Pack>> {
        match self.decode(buf)? {
            Some(pack) => Ok(Some(pack)),
            None if buf.is_empty() => Ok(None),
            None => {
                let expected = match PackHead::parse(buf) {
                    Ok(head) => head.len as usize,
                    Err(_) => HEADER_LEN,
                };
                Err(ProtocolError::ShortRead {
                    expected,
                    received: buf.len(),
                })
            }
        }
    }
}

/// A source that yields one decoded frame at a time.
///
/// `Ok(None)` means the source ended cleanly at a frame boundary.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Pack>>>;

    /// Whether a framing error leaves the source positioned at the next frame.
    ///
    /// Record-oriented sources (one frame per datagram) can skip a bad frame;
    /// byte streams lose their frame boundary and cannot.
    fn can_resync(&self) -> bool {
        false
    }
}

/// [`FrameSource`] over any byte stream (TCP, TLS, QUIC receive streams)
pub struct StreamFrames<R> {
    reader: R,
    codec: PackCodec,
}

impl<R> StreamFrames<R> {
    pub fn new(reader: R, codec: PackCodec) -> Self {
        Self { reader, codec }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R> FrameSource for StreamFrames<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Pack>>> {
        let codec = self.codec;
        Box::pin(async move { codec.read_frame(&mut self.reader).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::OpCode;

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let mut pack = Pack::new(OpCode(1000), 9, b"abcdef".to_vec());
        let bytes = PackCodec::stream().encode(&mut pack).unwrap();

        let mut codec = PackCodec::stream();
        let mut buf = BytesMut::from(&bytes[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[7..15]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[15..]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, b"abcdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_eof_mid_frame_is_short_read() {
        let mut codec = PackCodec::stream();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 20, 0, 0, 0, 1, 0, 0, 0, 1, 1, 2][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProtocolError::ShortRead {
                expected: 20,
                received: 14
            })
        ));
    }

    #[test]
    fn test_datagram_declared_len_below_header() {
        let bytes = [0u8, 0, 0, 4, 0, 0, 0, 1, 0, 0, 0, 1];
        assert!(matches!(
            PackCodec::datagram().decode_datagram(&bytes),
            Err(ProtocolError::PayloadLengthError { declared: 4 })
        ));
    }

    #[test]
    fn test_datagram_mismatch_after_valid_declaration() {
        let bytes = [0u8, 0, 0, 14, 0, 0, 0, 1, 0, 0, 0, 1];
        assert!(matches!(
            PackCodec::datagram().decode_datagram(&bytes),
            Err(ProtocolError::LengthMismatch {
                declared: 14,
                actual: 12
            })
        ));
    }

    #[test]
    fn test_stream_rejects_declared_len_below_header() {
        let mut codec = PackCodec::stream();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0, 1][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::PayloadLengthError { declared: 3 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let mut empty: &[u8] = &[];
        let result = PackCodec::stream().read_frame(&mut empty).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_read_frame_split_arrivals() {
        let mut pack = Pack::new(OpCode(1001), 77, vec![7u8; 300]);
        let bytes = PackCodec::stream().encode(&mut pack).unwrap();

        let (mut client, mut server) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in bytes.chunks(5) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let decoded = PackCodec::stream()
            .read_frame(&mut server)
            .await
            .unwrap()
            .unwrap();
        writer.await.unwrap();
        assert_eq!(decoded.sequence_id(), 77);
        assert_eq!(decoded.payload.len(), 300);
    }

    #[tokio::test]
    async fn test_read_frame_truncated_payload() {
        let mut bytes: &[u8] = &[0, 0, 0, 16, 0, 0, 0, 1, 0, 0, 0, 1, 9, 9];
        let err = PackCodec::stream().read_frame(&mut bytes).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: 16,
                received: 14
            }
        ));
    }
}
