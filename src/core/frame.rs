//! Wire envelope shared by every transport.
//!
//! ```text
//! [type id: u16 LE][frame length: i32 LE][payload: frame length - 6 bytes]
//! ```
//!
//! The frame length counts the 6 header bytes as well, so the smallest legal
//! frame is 6 bytes long and carries an empty payload.

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};

/// Size of the fixed frame header in bytes
pub const HEADER_SIZE: usize = 6;

/// One framed packet as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire id of the packet type carried in `payload`
    pub type_id: u16,
    /// Converter output for the packet
    pub payload: Vec<u8>,
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub type_id: u16,
    /// Total frame length including the header
    pub frame_len: usize,
}

impl FrameHeader {
    /// Parse and validate a header from the first 6 bytes of `data`.
    ///
    /// `max_frame_size` bounds the announced length before anything is allocated.
    pub fn parse(data: &[u8], max_frame_size: usize) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }

        let type_id = u16::from_le_bytes([data[0], data[1]]);
        let announced = i32::from_le_bytes([data[2], data[3], data[4], data[5]]);

        if announced < HEADER_SIZE as i32 {
            return Err(ProtocolError::InvalidHeader);
        }

        let frame_len = announced as usize;
        if frame_len > max_frame_size {
            return Err(ProtocolError::OversizedPacket(frame_len));
        }

        Ok(Self { type_id, frame_len })
    }

    /// Payload length announced by this header
    pub fn payload_len(&self) -> usize {
        self.frame_len - HEADER_SIZE
    }
}

impl Frame {
    pub fn new(type_id: u16, payload: Vec<u8>) -> Self {
        Self { type_id, payload }
    }

    /// Total number of bytes this frame occupies on the wire
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Write the header fields into `dst`
    pub fn write_header(&self, dst: &mut [u8; HEADER_SIZE]) -> Result<()> {
        let len = i32::try_from(self.frame_len())
            .map_err(|_| ProtocolError::OversizedPacket(self.frame_len()))?;
        dst[..2].copy_from_slice(&self.type_id.to_le_bytes());
        dst[2..].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    /// Serialize the frame into a contiguous buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut header = [0u8; HEADER_SIZE];
        self.write_header(&mut header)?;

        let mut out = Vec::with_capacity(self.frame_len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse exactly one frame from `data`.
    ///
    /// Trailing bytes after the announced length are rejected, a short buffer is
    /// reported as `InvalidHeader`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_bytes_within(data, MAX_FRAME_SIZE)
    }

    /// [`Frame::from_bytes`] with a connection-specific size limit
    pub fn from_bytes_within(data: &[u8], max_frame_size: usize) -> Result<Self> {
        let header = FrameHeader::parse(data, max_frame_size)?;
        if data.len() != header.frame_len {
            return Err(ProtocolError::InvalidHeader);
        }

        Ok(Self {
            type_id: header.type_id,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}
