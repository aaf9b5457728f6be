//! Virtual packets.
//!
//! A [`VirtualPacket`] is the unit of transport on the virtual network. It is
//! immutable: forwarding never edits a packet in place, it produces a new one
//! through [`VirtualPacket::hop`] with the TTL reduced by one.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::VirtualAddress;

/// Largest payload a single virtual packet may carry (64 KiB).
pub const MAX_PACKET_PAYLOAD: usize = 64 * 1024;

/// Protocol tag, the virtual "port" a packet is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolTag(pub u16);

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ProtocolTag {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Addressed, TTL-bounded packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualPacket {
    src: VirtualAddress,
    dst: VirtualAddress,
    tag: ProtocolTag,
    ttl: u8,
    payload: Bytes,
}

impl VirtualPacket {
    /// Build a packet.
    pub fn new(
        src: VirtualAddress,
        dst: VirtualAddress,
        tag: impl Into<ProtocolTag>,
        payload: impl Into<Bytes>,
        ttl: u8,
    ) -> Self {
        Self { src, dst, tag: tag.into(), ttl, payload: payload.into() }
    }

    /// Source address.
    pub fn src(&self) -> VirtualAddress {
        self.src
    }

    /// Destination address.
    pub fn dst(&self) -> VirtualAddress {
        self.dst
    }

    /// Protocol tag the packet is addressed to.
    pub fn tag(&self) -> ProtocolTag {
        self.tag
    }

    /// Remaining hops.
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Payload bytes (cheap to clone).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Take one forwarding hop.
    ///
    /// Returns `None` when the TTL is already zero, in which case the packet
    /// must be dropped rather than forwarded.
    #[must_use]
    pub fn hop(&self) -> Option<Self> {
        let ttl = self.ttl.checked_sub(1)?;
        Some(Self { ttl, ..self.clone() })
    }

    /// Same packet with a different source address.
    ///
    /// Used by the bridge to stamp packets arriving from a real connection
    /// with the session's own address.
    #[must_use]
    pub fn with_source(&self, src: VirtualAddress) -> Self {
        Self { src, ..self.clone() }
    }

    /// A reply travelling back to this packet's source on the same tag.
    pub fn reply(&self, payload: impl Into<Bytes>, ttl: u8) -> Self {
        Self::new(self.dst, self.src, self.tag, payload, ttl)
    }
}
