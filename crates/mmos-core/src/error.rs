//! Error types for the kernel core.
//!
//! Every error here is recoverable by the caller. Dropped packets are not
//! errors: they are counted in [`crate::NetStats`] and never surfaced.

use mmos_proto::{ProtocolError, ProtocolTag, VirtualAddress};
use thiserror::Error;

use crate::{connection::ConnectionState, kernel::KernelState};

/// Address allocation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Every address in the configured space is in use
    #[error("address space exhausted: {capacity} addresses in use")]
    Exhausted {
        /// Configured capacity
        capacity: usize,
    },

    /// Release or lookup of an address that is not allocated
    #[error("address {0} is not allocated")]
    NotAllocated(VirtualAddress),

    /// Release of an address that packets still reference
    #[error("address {address} has {pending} packets in flight")]
    InFlight {
        /// Address being released
        address: VirtualAddress,
        /// Packets still referencing it
        pending: u32,
    },

    /// Reservation of an address that is already taken
    #[error("address {0} is already allocated")]
    AlreadyAllocated(VirtualAddress),
}

impl AddressError {
    /// Whether this is one of the "invalid address" cases of `release`.
    pub fn is_invalid_address(&self) -> bool {
        matches!(self, Self::NotAllocated(_) | Self::InFlight { .. })
    }
}

/// Virtual network stack errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// (address, tag) already has an endpoint bound
    #[error("port {address}:{tag} is already in use")]
    PortInUse {
        /// Local address
        address: VirtualAddress,
        /// Requested tag
        tag: ProtocolTag,
    },

    /// No endpoint is bound on this tag
    #[error("no endpoint bound on tag {0}")]
    UnknownEndpoint(ProtocolTag),

    /// Endpoint exists but belongs to another app instance
    #[error("endpoint on tag {0} is owned by another instance")]
    NotOwner(ProtocolTag),

    /// Payload above the per-packet limit
    #[error("packet payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// App catalog errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    /// An app with this id is already installed
    #[error("app {0:?} is already installed")]
    Duplicate(String),

    /// No app with this id is installed
    #[error("app {0:?} is not installed")]
    Unknown(String),
}

/// Navigation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Instantiation failed; the stack is unchanged
    #[error(transparent)]
    App(#[from] AppError),

    /// Operation needs at least one frame
    #[error("navigation stack is empty")]
    EmptyStack,

    /// A system overlay holds focus
    #[error("a system overlay is showing")]
    OverlayActive,

    /// `dismiss_overlay` without an overlay
    #[error("no overlay is showing")]
    NoOverlay,
}

/// Kernel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Operation not allowed in the current kernel state
    #[error("invalid kernel state {state:?} for operation {operation}")]
    InvalidState {
        /// Current state
        state: KernelState,
        /// Attempted operation
        operation: &'static str,
    },

    /// Navigation failed
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Session link errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Operation not allowed in the current link state
    #[error("invalid connection state {state:?} for operation {operation}")]
    InvalidState {
        /// Current state
        state: ConnectionState,
        /// Attempted operation
        operation: String,
    },

    /// Frame not allowed in the current link state
    #[error("unexpected frame opcode {opcode:#06x} in state {state:?}")]
    UnexpectedFrame {
        /// Current state
        state: ConnectionState,
        /// Raw opcode received
        opcode: u16,
    },

    /// Peer speaks another protocol version
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this build speaks
        expected: u8,
        /// Version the peer announced
        actual: u8,
    },

    /// Payload could not be decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Persisted layout storage errors.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// Storage I/O failed
    #[error("layout I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Document is not valid layout JSON
    #[error("layout is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Frame transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket I/O failed
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Bytes on the wire are not a valid frame
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
