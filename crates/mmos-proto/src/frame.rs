//! Complete frames: header plus payload bytes.

use bytes::Bytes;

use crate::{FrameHeader, ProtocolError, Result};

/// A header and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fixed header
    pub header: FrameHeader,
    /// Raw CBOR payload
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, fixing up the header's payload size.
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        header.set_payload_size(payload.len() as u32);
        Self { header, payload }
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        FrameHeader::SIZE + self.payload.len()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.reserve(self.encoded_len());
        dst.extend_from_slice(&self.header.to_bytes());
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Decode exactly one frame from `bytes`.
    ///
    /// Trailing bytes beyond the declared payload are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;
        let size = header.payload_size() as usize;
        let end = FrameHeader::SIZE + size;

        if bytes.len() < end {
            return Err(ProtocolError::FrameTooShort { expected: end, actual: bytes.len() });
        }

        Ok(Self { header, payload: Bytes::copy_from_slice(&bytes[FrameHeader::SIZE..end]) })
    }
}
