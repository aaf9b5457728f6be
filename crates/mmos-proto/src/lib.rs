//! Wire format for the MMOS virtual network.
//!
//! Two layers live here. The *virtual* layer ([`VirtualAddress`],
//! [`VirtualPacket`]) is what apps and kernels see: addressed packets with a
//! protocol tag and a TTL. The *real* layer ([`Frame`]) is what crosses a TCP
//! connection between a device front-end and the server bridge.
//!
//! Frames consist of a fixed 16-byte header (zero-copy, big-endian) followed
//! by a variable-length CBOR payload. The bridge makes routing decisions
//! on the opcode alone and only decodes payloads it needs.
//!
//! ```text
//! ┌────────────────────────── 16 bytes ──────────────────────────┐
//! │ magic "MMOS" │ ver │ flags │ opcode u16 │ len u32 │ reserved │
//! └──────────────────────────────────────────────────────────────┘
//! │ CBOR payload (len bytes, at most 16 MiB)                     │
//! ```
//!
//! Web pages hosted at `System` addresses travel inside virtual packets as
//! the [`http`] request/response envelope.
//!
//! # Security
//!
//! None. The virtual network is a closed simulation layer. Parsing is still
//! strict: headers go through `zerocopy`, sizes are bounded before any
//! allocation, and unknown opcodes are rejected.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod errors;
pub mod frame;
pub mod header;
pub mod http;
pub mod opcodes;
pub mod packet;
pub mod payloads;

pub use address::{AddressKind, VirtualAddress, well_known};
pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use http::{HttpRequest, HttpResponse};
pub use opcodes::Opcode;
pub use packet::{MAX_PACKET_PAYLOAD, ProtocolTag, VirtualPacket};
pub use payloads::Payload;
