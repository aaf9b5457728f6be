//! Protocol error types.

use thiserror::Error;

/// Result alias for wire-level operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer shorter than the structure being read
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header magic does not spell "MMOS"
    #[error("invalid magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    /// Header version this build cannot speak
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Opcode outside the known set
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),

    /// Frame payload exceeds [`crate::FrameHeader::MAX_PAYLOAD_SIZE`]
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Declared or actual size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Virtual packet payload exceeds [`crate::MAX_PACKET_PAYLOAD`]
    #[error("packet payload too large: {0} bytes")]
    PacketTooLarge(usize),

    /// CBOR serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),

    /// Text could not be parsed as a virtual address
    #[error("invalid virtual address: {0:?}")]
    InvalidAddress(String),
}
