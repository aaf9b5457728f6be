//! Frame payload types.
//!
//! Each opcode has exactly one payload shape. [`Payload`] ties the two
//! together so that callers never pick an opcode by hand.
//!
//! # Session Flow
//!
//! ```text
//! front-end                         bridge
//!    │ ── Hello{version, name} ────────> │  allocate address
//!    │ <── HelloReply{session, addr} ─── │
//!    │ <═══ Packet / Ping / Pong ══════> │
//!    │ ── Goodbye{reason} ─────────────> │  drain, release address
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{
    Frame, FrameHeader, MAX_PACKET_PAYLOAD, Opcode, ProtocolError, Result, VirtualAddress,
    VirtualPacket,
};

/// Session open request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the front-end speaks
    pub version: u8,
    /// Free-form client name, for logs
    pub client_name: String,
}

/// Session accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Session identifier assigned by the bridge
    pub session_id: u64,
    /// Virtual address of the device kernel bound to this session
    pub address: VirtualAddress,
    /// Address the front-end itself is reachable at
    pub player: VirtualAddress,
    /// TTL the front-end should stamp on new packets
    pub default_ttl: u8,
    /// Interval at which the bridge sends heartbeats
    pub heartbeat_interval_ms: u64,
}

/// Session close notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Human-readable reason
    pub reason: String,
}

/// Category of a session-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum ErrorCode {
    /// No virtual address left to assign
    AddressExhausted = 1,
    /// Peer sent something the session state does not allow
    ProtocolViolation = 2,
    /// Handshake did not complete in time
    HandshakeTimeout = 3,
    /// Bridge-side failure
    Internal = 4,
}

/// Session-level error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error category
    pub code: ErrorCode,
    /// Details, for logs
    pub message: String,
}

/// Typed frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Session open request
    Hello(Hello),
    /// Session accepted
    HelloReply(HelloReply),
    /// Session close
    Goodbye(Goodbye),
    /// Liveness check (no body)
    Ping,
    /// Liveness answer (no body)
    Pong,
    /// One virtual packet
    Packet(VirtualPacket),
    /// Session-level error
    Error(ErrorPayload),
}

impl Payload {
    /// Opcode that carries this payload.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::HelloReply(_) => Opcode::HelloReply,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Ping => Opcode::Ping,
            Self::Pong => Opcode::Pong,
            Self::Packet(_) => Opcode::Packet,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Serialize into a frame.
    pub fn into_frame(self) -> Result<Frame> {
        let header = FrameHeader::new(self.opcode());
        let body = match &self {
            Self::Hello(hello) => to_cbor(hello)?,
            Self::HelloReply(reply) => to_cbor(reply)?,
            Self::Goodbye(goodbye) => to_cbor(goodbye)?,
            Self::Ping | Self::Pong => Vec::new(),
            Self::Packet(packet) => {
                check_packet(packet)?;
                to_cbor(packet)?
            },
            Self::Error(error) => to_cbor(error)?,
        };

        Ok(Frame::new(header, body))
    }

    /// Deserialize the payload of `frame` according to its opcode.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        let body = frame.payload.as_ref();

        Ok(match opcode {
            Opcode::Hello => Self::Hello(from_cbor(body)?),
            Opcode::HelloReply => Self::HelloReply(from_cbor(body)?),
            Opcode::Goodbye => Self::Goodbye(from_cbor(body)?),
            Opcode::Ping => Self::Ping,
            Opcode::Pong => Self::Pong,
            Opcode::Packet => {
                let packet: VirtualPacket = from_cbor(body)?;
                check_packet(&packet)?;
                Self::Packet(packet)
            },
            Opcode::Error => Self::Error(from_cbor(body)?),
        })
    }
}

fn check_packet(packet: &VirtualPacket) -> Result<()> {
    if packet.payload().len() > MAX_PACKET_PAYLOAD {
        return Err(ProtocolError::PacketTooLarge(packet.payload().len()));
    }
    Ok(())
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
