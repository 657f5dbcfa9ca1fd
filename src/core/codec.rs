use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::core::frame::{Frame, FrameHeader, HEADER_SIZE};
use crate::error::{ProtocolError, Result};

/// Tokio codec that splits a byte stream into [`Frame`]s.
///
/// The same codec is used for datagrams, where each datagram carries exactly
/// one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::parse(&src[..HEADER_SIZE], self.max_frame_size)?;
        if src.len() < header.frame_len {
            src.reserve(header.frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(header.payload_len()).to_vec();

        Ok(Some(Frame {
            type_id: header.type_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let frame_len = frame.frame_len();
        if frame_len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(frame_len));
        }

        let len = i32::try_from(frame_len).map_err(|_| ProtocolError::OversizedPacket(frame_len))?;
        dst.reserve(frame_len);
        dst.put_u16_le(frame.type_id);
        dst.put_i32_le(len);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
