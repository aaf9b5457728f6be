//! Virtual addresses.
//!
//! A [`VirtualAddress`] identifies one participant of the simulated network,
//! the way an IP address identifies a host. The `kind` says what sort of
//! participant it is, which is also what the server switch routes on:
//!
//! | kind     | code | meaning                                        |
//! |----------|------|------------------------------------------------|
//! | `Player` | 0    | the human front-end attached to a session      |
//! | `Device` | 1    | a simulated device (one kernel)                |
//! | `Server` | 2    | host-side service outside the simulation       |
//! | `System` | 3    | built-in service hosted by the bridge          |
//!
//! The textual form is `<code>-<id as 8 hex digits>`, e.g. `1-0000002a`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::ProtocolError;

/// Category of a virtual address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum AddressKind {
    /// Human front-end of a session
    Player = 0,
    /// Simulated device
    Device = 1,
    /// Host-side service
    Server = 2,
    /// Bridge-hosted system service
    System = 3,
}

impl AddressKind {
    /// Numeric code used in the textual form.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Player),
            1 => Some(Self::Device),
            2 => Some(Self::Server),
            3 => Some(Self::System),
            _ => None,
        }
    }
}

/// Simulation-local address of a network participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualAddress {
    kind: AddressKind,
    id: u32,
}

impl VirtualAddress {
    /// Create an address from its parts.
    pub const fn new(kind: AddressKind, id: u32) -> Self {
        Self { kind, id }
    }

    /// Device address.
    pub const fn device(id: u32) -> Self {
        Self::new(AddressKind::Device, id)
    }

    /// Player (front-end) address.
    pub const fn player(id: u32) -> Self {
        Self::new(AddressKind::Player, id)
    }

    /// Host-side server address.
    pub const fn server(id: u32) -> Self {
        Self::new(AddressKind::Server, id)
    }

    /// Bridge-hosted system service address.
    pub const fn system(id: u32) -> Self {
        Self::new(AddressKind::System, id)
    }

    /// Address kind.
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Numeric id within the kind.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this is a device address.
    pub fn is_device(&self) -> bool {
        self.kind == AddressKind::Device
    }

    /// The player address paired with this device (same id).
    pub fn paired_player(&self) -> Self {
        Self::player(self.id)
    }

    /// The device address paired with this player (same id).
    pub fn paired_device(&self) -> Self {
        Self::device(self.id)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:08x}", self.kind.code(), self.id)
    }
}

impl FromStr for VirtualAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidAddress(s.to_string());

        let (kind, id) = s.split_once('-').ok_or_else(invalid)?;
        if kind.len() != 1 || id.len() != 8 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let kind = kind.parse::<u8>().ok().and_then(AddressKind::from_code).ok_or_else(invalid)?;
        let id = u32::from_str_radix(id, 16).map_err(|_| invalid())?;

        Ok(Self::new(kind, id))
    }
}

/// Addresses of the system services every bridge hosts.
pub mod well_known {
    use super::VirtualAddress;

    /// Echo service: replies with the request payload.
    pub const ECHO: VirtualAddress = VirtualAddress::system(1);

    /// Time service: replies with bridge uptime in milliseconds, as decimal text.
    pub const TIME: VirtualAddress = VirtualAddress::system(2);

    /// Test web server: answers [`crate::http`] requests on `/`, `/api/echo`
    /// and `/api/info`.
    pub const TEST_SERVER: VirtualAddress = VirtualAddress::system(3);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn display_uses_code_and_padded_hex() {
        assert_eq!(VirtualAddress::device(42).to_string(), "1-0000002a");
        assert_eq!(well_known::ECHO.to_string(), "3-00000001");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "1", "1-", "1-2a", "4-0000002a", "x-0000002a", "1-0000002g", "11-0000002a"]
        {
            assert!(bad.parse::<VirtualAddress>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn player_device_pairing() {
        let device = VirtualAddress::device(7);
        assert_eq!(device.paired_player(), VirtualAddress::player(7));
        assert_eq!(device.paired_player().paired_device(), device);
    }

    proptest! {
        #[test]
        fn text_form_parses_back(code in 0u8..4, id in any::<u32>()) {
            let kind = AddressKind::from_code(code).unwrap();
            let addr = VirtualAddress::new(kind, id);
            prop_assert_eq!(addr.to_string().parse::<VirtualAddress>().unwrap(), addr);
        }
    }
}
