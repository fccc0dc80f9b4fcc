//! Framed codec for the negotiated wire mode.
//!
//! Each frame is an 8-byte big-endian length followed by that many payload
//! bytes. A zero-length frame is a heartbeat. Encoding goes through
//! LengthDelimitedCodec; decoding checks the declared length against
//! [`MAX_FRAME_LEN`] before buffering anything, so an oversized header is
//! rejected without reading its body.

use std::io;

use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const HEADER_LEN: usize = 8;
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("declared frame length {declared} exceeds the {} byte limit", MAX_FRAME_LEN)]
    TooLarge { declared: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Zero-length keepalive. Carries nothing and is never a response.
    Heartbeat,
    Payload(Bytes),
}

pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let declared = u64::from_be_bytes(header);
        if declared > MAX_FRAME_LEN as u64 {
            return Err(FrameError::TooLarge { declared });
        }

        let len = declared as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        if len == 0 {
            tracing::trace!("Heartbeat frame");
            return Ok(Some(Frame::Heartbeat));
        }

        let payload = src.split_to(len).freeze();
        tracing::trace!(payload_bytes = len, "Decoded frame");
        Ok(Some(Frame::Payload(payload)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                declared: len as u64,
            });
        }
        tracing::trace!(payload_bytes = len, "Encoding frame");
        if len > 1_000_000 {
            tracing::debug!(
                payload_bytes = len,
                payload_kb = len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(item, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(len: u64) -> [u8; HEADER_LEN] {
        len.to_be_bytes()
    }

    #[test]
    fn encode_writes_eight_byte_big_endian_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"ping"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x00\x00\x00\x00\x00\x00\x04ping");
    }

    #[test]
    fn zero_length_frame_is_heartbeat() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&header(0)[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Heartbeat));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_payload_waits_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&header(10));
        buf.extend_from_slice(b"{\"sta");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"tus\"}");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Payload(Bytes::from_static(b"{\"status\"}")));
    }

    #[test]
    fn oversized_declared_length_is_rejected_from_header_alone() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&header(MAX_FRAME_LEN as u64 + 1)[..]);
        let capacity_before = buf.capacity();

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::TooLarge { declared } if declared == MAX_FRAME_LEN as u64 + 1
        ));
        // Nothing was reserved for the declared body.
        assert_eq!(buf.capacity(), capacity_before);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&header(0));
        buf.extend_from_slice(&header(2));
        buf.extend_from_slice(b"{}");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Heartbeat));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Payload(Bytes::from_static(b"{}")))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
