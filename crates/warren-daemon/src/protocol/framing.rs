//! Varint-length frame codec for the control socket.
//!
//! Each message on the wire is an unsigned LEB128 length (32-bit max)
//! followed by that many bytes of protobuf payload:
//!
//! ```text
//! +----------------+------------------+
//! | Length (varint)| Payload          |
//! +----------------+------------------+
//! ```
//!
//! The length is validated before any allocation; a frame above the
//! configured cap fails the connection rather than the process.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use warren_core::error::{Error, ErrorKind};

/// Hard upper bound any codec instance may be configured with.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Frame codec used with [`tokio_util::codec::Framed`] over the unix
/// socket.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(32 * 1024 * 1024)
    }
}

impl FrameCodec {
    /// Creates a codec capped at `max_frame_size` payload bytes.
    ///
    /// # Panics
    ///
    /// Panics if the cap exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        assert!(
            max_frame_size <= MAX_FRAME_SIZE,
            "frame cap {max_frame_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self { max_frame_size }
    }

    /// The configured payload cap.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/// Decodes one LEB128 varint from the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed and the consumed
/// length alongside the value once complete.
fn decode_varint(buf: &[u8]) -> Result<Option<(u32, usize)>, Error> {
    let mut value: u32 = 0;
    for (idx, byte) in buf.iter().enumerate() {
        if idx == 5 {
            return Err(Error::new(ErrorKind::Unknown, "frame length varint too long"));
        }
        let bits = u32::from(byte & 0x7f);
        value |= bits
            .checked_shl(7 * idx as u32)
            .ok_or_else(|| Error::new(ErrorKind::Unknown, "frame length overflow"))?;
        if byte & 0x80 == 0 {
            return Ok(Some((value, idx + 1)));
        }
    }
    Ok(None)
}

/// Encodes `value` as LEB128 into `dst`.
fn encode_varint(mut value: u32, dst: &mut BytesMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        let Some((length, header_len)) = decode_varint(&src[..])? else {
            return Ok(None);
        };
        let length = length as usize;

        // Checked before any allocation happens for the payload.
        if length > self.max_frame_size {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("oversized request: {length}"),
            ));
        }

        let total = header_len + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        if item.len() > self.max_frame_size {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("oversized response: {}", item.len()),
            ));
        }
        dst.reserve(5 + item.len());
        encode_varint(item.len() as u32, dst);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut codec = FrameCodec::default();
        let payload = Bytes::from_static(b"hello container");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        // 15 bytes: single-byte varint.
        assert_eq!(buf[0], 15);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn multi_byte_varint() {
        let mut codec = FrameCodec::default();
        let payload = Bytes::from(vec![0xabu8; 300]);

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        // 300 = 0xAC 0x02 in LEB128.
        assert_eq!(&buf[..2], &[0xac, 0x02]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), 300);
    }

    #[test]
    fn partial_header_and_payload() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Length says 10, only 4 bytes present.
        buf.put_u8(10);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&[5, 6, 7, 8, 9, 10]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 10);
    }

    #[test]
    fn incomplete_varint_waits() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u8(0x80); // Continuation bit, no terminator yet.
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        encode_varint(2048, &mut buf);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(codec.decode(&mut buf).is_err());

        let mut out = BytesMut::new();
        assert!(codec
            .encode(Bytes::from(vec![0u8; 2048]), &mut out)
            .is_err());
    }

    #[test]
    fn runaway_varint_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "one");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "two");
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        assert_eq!(buf.len(), 1);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }
}
