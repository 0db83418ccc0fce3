//! Frame codec for connections.
//!
//! One frame on the wire is `len:u32 BE ‖ type-id:16 ‖ payload`, where `len`
//! excludes itself. Length is validated against the configured maximum
//! before any allocation happens.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::registry::MessageTypeID;
use crate::error::{Error, Result};

/// Default upper bound on one frame (length field value).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One framed message: type id plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageTypeID,
    pub payload: Bytes,
}

impl Frame {
    /// Bytes this frame occupies on the wire, header included.
    pub fn wire_len(&self) -> u64 {
        4 + 16 + self.payload.len() as u64
    }
}

/// Tokio codec implementing the frame format.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = 16 + frame.payload.len();
        if len > self.max_frame {
            return Err(Error::Encoding(format!(
                "frame of {len} bytes exceeds maximum of {}",
                self.max_frame
            )));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_slice(&frame.msg_type.0);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len < 16 {
            return Err(Error::Encoding(format!("frame length {len} shorter than a type id")));
        }
        if len > self.max_frame {
            return Err(Error::Encoding(format!(
                "frame of {len} bytes exceeds maximum of {}",
                self.max_frame
            )));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut id = [0u8; 16];
        id.copy_from_slice(&src[..16]);
        src.advance(16);
        let payload = src.split_to(len - 16).freeze();
        Ok(Some(Frame {
            msg_type: MessageTypeID(id),
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_id() -> MessageTypeID {
        MessageTypeID([7u8; 16])
    }

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::default();
        let frame = Frame {
            msg_type: probe_id(),
            payload: Bytes::from_static(b"hello"),
        };
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len() as u64, frame.wire_len());
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_asks_for_more() {
        let mut codec = FrameCodec::default();
        let frame = Frame {
            msg_type: probe_id(),
            payload: Bytes::from_static(b"split me"),
        };
        let mut full = BytesMut::new();
        codec.encode(frame.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), frame);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new(64);
        let frame = Frame {
            msg_type: probe_id(),
            payload: Bytes::from(vec![0u8; 128]),
        };
        assert!(codec.encode(frame, &mut BytesMut::new()).is_err());

        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_slice(&[0u8; 32]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn undersized_length_is_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(&[0u8; 3]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut codec = FrameCodec::default();
        let a = Frame { msg_type: probe_id(), payload: Bytes::from_static(b"a") };
        let b = Frame { msg_type: probe_id(), payload: Bytes::from_static(b"bb") };
        let mut buf = BytesMut::new();
        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
