//! System services.
//!
//! A service owns one `System` address. It sees every packet switched to
//! that address and may answer; the answer travels back to the sender on
//! the request's tag.

use std::time::Instant;

use bytes::Bytes;
use mmos_proto::{VirtualAddress, VirtualPacket, well_known};

/// Request/response service hosted by the bridge.
pub trait SystemService: Send + Sync {
    /// Address the service answers on.
    fn address(&self) -> VirtualAddress;

    /// Name, for logs.
    fn name(&self) -> &'static str;

    /// Handle one request. `None` sends nothing back.
    fn handle(&self, request: &VirtualPacket, now: Instant) -> Option<Bytes>;
}

/// Returns the request payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoService;

impl SystemService for EchoService {
    fn address(&self) -> VirtualAddress {
        well_known::ECHO
    }

    fn name(&self) -> &'static str {
        "echo"
    }

    fn handle(&self, request: &VirtualPacket, _now: Instant) -> Option<Bytes> {
        Some(request.payload().clone())
    }
}

/// Bridge uptime in milliseconds, as decimal text.
#[derive(Debug, Clone, Copy)]
pub struct TimeService {
    started: Instant,
}

impl TimeService {
    /// Service counting from `started`.
    pub fn new(started: Instant) -> Self {
        Self { started }
    }
}

impl SystemService for TimeService {
    fn address(&self) -> VirtualAddress {
        well_known::TIME
    }

    fn name(&self) -> &'static str {
        "time"
    }

    fn handle(&self, _request: &VirtualPacket, now: Instant) -> Option<Bytes> {
        let uptime = now.saturating_duration_since(self.started);
        Some(Bytes::from(uptime.as_millis().to_string()))
    }
}
