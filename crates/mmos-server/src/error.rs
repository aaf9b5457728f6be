//! Server error types.

use std::time::Duration;

use mmos_core::{
    AddressError, KernelError,
    error::{ConnectionError, TransportError},
};
use mmos_proto::ProtocolError;
use thiserror::Error;

/// Errors from the bridge, its sessions and the client.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame read or write failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire encoding failed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Peer broke the session protocol
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Address allocation failed
    #[error("address error: {0}")]
    Address(#[from] AddressError),

    /// Device kernel failed
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// No Hello within the handshake timeout
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Peer hung up before the session was established
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    /// Bridge answered the Hello with an error
    #[error("session rejected: {0}")]
    Rejected(String),
}
