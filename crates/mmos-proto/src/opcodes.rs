//! Frame opcodes.

/// Operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Front-end opens a session
    Hello = 0x0001,
    /// Bridge accepts a session and assigns an address
    HelloReply = 0x0002,
    /// Either side closes the session
    Goodbye = 0x0003,
    /// Liveness check
    Ping = 0x0004,
    /// Liveness answer
    Pong = 0x0005,
    /// Carries one virtual packet
    Packet = 0x0010,
    /// Session-level error report
    Error = 0x00ff,
}

impl Opcode {
    /// Wire value.
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Hello),
            0x0002 => Some(Self::HelloReply),
            0x0003 => Some(Self::Goodbye),
            0x0004 => Some(Self::Ping),
            0x0005 => Some(Self::Pong),
            0x0010 => Some(Self::Packet),
            0x00ff => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether frames with this opcode carry a CBOR payload.
    pub fn has_payload(self) -> bool {
        !matches!(self, Self::Ping | Self::Pong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        for op in [
            Opcode::Hello,
            Opcode::HelloReply,
            Opcode::Goodbye,
            Opcode::Ping,
            Opcode::Pong,
            Opcode::Packet,
            Opcode::Error,
        ] {
            assert_eq!(Opcode::from_u16(op.to_u16()), Some(op));
        }
        assert_eq!(Opcode::from_u16(0x0000), None);
    }
}
