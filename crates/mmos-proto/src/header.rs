//! Fixed frame header.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U16, U32},
};

use crate::{Opcode, ProtocolError, Result};

/// 16-byte frame header, big-endian on the wire.
///
/// Layout:
/// - `0..4`   magic `b"MMOS"`
/// - `4`      protocol version
/// - `5`      flags (reserved, zero)
/// - `6..8`   opcode
/// - `8..12`  payload size
/// - `12..16` reserved
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct FrameHeader {
    magic: [u8; 4],
    version: u8,
    flags: u8,
    opcode: U16,
    payload_size: U32,
    reserved: [u8; 4],
}

impl FrameHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 16;

    /// Magic bytes at the start of every frame.
    pub const MAGIC: [u8; 4] = *b"MMOS";

    /// Protocol version spoken by this build.
    pub const VERSION: u8 = 1;

    /// Largest payload a frame may declare (16 MiB).
    pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

    /// Header for `opcode` with an empty payload.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            flags: 0,
            opcode: U16::new(opcode.to_u16()),
            payload_size: U32::new(0),
            reserved: [0; 4],
        }
    }

    /// Parse and validate a header from the start of `bytes`.
    ///
    /// Checks magic, version and the declared payload size. The opcode is
    /// left raw so that callers can decide how to treat unknown values.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (header, _) = Self::read_from_prefix(bytes).map_err(|_| {
            ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() }
        })?;

        if header.magic != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(header.magic));
        }
        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        if header.payload_size.get() > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: header.payload_size.get() as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Raw header bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Raw opcode value.
    pub fn opcode(&self) -> u16 {
        self.opcode.get()
    }

    /// Opcode, if it is one this build knows.
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Declared payload length.
    pub fn payload_size(&self) -> u32 {
        self.payload_size.get()
    }

    /// Protocol version.
    pub fn version(&self) -> u8 {
        self.version
    }

    pub(crate) fn set_payload_size(&mut self, size: u32) {
        self.payload_size = U32::new(size);
    }
}
