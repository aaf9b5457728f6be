//! Packet switch between device sessions, system services and the real
//! connections.
//!
//! Every packet the switch forwards takes one hop. The destination kind
//! decides where it goes:
//!
//! ```text
//! Device(n)  -> inbound queue of the session owning Device(n)
//! System(n)  -> service or web server at System(n); its answer is
//!               switched back
//! Player(n)  -> real connection of the session owning Device(n)
//! Server(n)  -> real connection of the sending session
//! otherwise  -> dropped
//! ```
//!
//! The switch takes over the in-flight references of every packet handed to
//! [`Switch::route`] and ends them once the packet leaves the simulation
//! (written to a connection, consumed by a service, or dropped). Packets put
//! into a device inbound queue keep their references until the kernel
//! drains them.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use mmos_core::{AddressError, SharedRegistry};
use mmos_proto::{AddressKind, Frame, Payload, VirtualAddress, VirtualPacket};
use tokio::sync::mpsc;

use crate::{http::SystemServerRegistry, system::SystemService};

/// Queues the switch feeds for one session.
#[derive(Debug, Clone)]
pub struct SessionPorts {
    /// The device kernel's inbound relay
    pub inbound: mpsc::Sender<VirtualPacket>,
    /// Frames for the session's real connection
    pub external: mpsc::Sender<Frame>,
}

/// Switch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchStats {
    /// Packets queued for a device kernel
    pub to_device: u64,
    /// Requests handed to a system service
    pub to_service: u64,
    /// Packets written to a real connection
    pub to_external: u64,
    /// Dropped: TTL expired
    pub dropped_ttl: u64,
    /// Dropped: nobody owns the destination
    pub dropped_unknown: u64,
    /// Dropped: destination queue full
    pub dropped_full: u64,
}

enum Dropped {
    Unknown,
    Full,
}

/// Router shared by every session of one bridge.
pub struct Switch {
    registry: SharedRegistry,
    sessions: Mutex<HashMap<VirtualAddress, SessionPorts>>,
    services: HashMap<VirtualAddress, Box<dyn SystemService>>,
    web: SystemServerRegistry,
    reply_ttl: u8,
    stats: Mutex<SwitchStats>,
}

impl Switch {
    /// Switch over `registry`. Service answers carry `reply_ttl`.
    pub fn new(registry: SharedRegistry, reply_ttl: u8) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
            services: HashMap::new(),
            web: SystemServerRegistry::new(),
            reply_ttl,
            stats: Mutex::new(SwitchStats::default()),
        }
    }

    /// Host `service` and reserve its address.
    ///
    /// # Errors
    /// Returns `AlreadyAllocated` if the address is taken.
    pub fn with_service(
        mut self,
        service: impl SystemService + 'static,
    ) -> Result<Self, AddressError> {
        let address = service.address();
        self.registry.reserve(address)?;
        tracing::debug!(%address, service = service.name(), "system service registered");
        self.services.insert(address, Box::new(service));
        Ok(self)
    }

    /// Host the web servers in `servers` and reserve their addresses.
    ///
    /// # Errors
    /// Returns `AlreadyAllocated` if an address is taken.
    pub fn with_web_servers(mut self, servers: SystemServerRegistry) -> Result<Self, AddressError> {
        for address in servers.addresses() {
            self.registry.reserve(address)?;
        }
        tracing::debug!(servers = ?servers.ids(), "web servers registered");
        self.web = servers;
        Ok(self)
    }

    /// Web servers hosted by the switch.
    pub fn web_servers(&self) -> &SystemServerRegistry {
        &self.web
    }

    /// Registry the switch accounts against.
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Counters.
    pub fn stats(&self) -> SwitchStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Attach the session owning `device`.
    pub fn register(&self, device: VirtualAddress, ports: SessionPorts) {
        self.sessions().insert(device, ports);
    }

    /// Detach the session owning `device`. Packets for it are dropped from
    /// now on.
    pub fn unregister(&self, device: VirtualAddress) -> bool {
        self.sessions().remove(&device).is_some()
    }

    /// Take a packet from the real connection of the session owning
    /// `device`.
    ///
    /// The source is overwritten with the session's player address so that
    /// clients cannot impersonate other addresses.
    pub fn inject_from_client(&self, device: VirtualAddress, packet: &VirtualPacket, now: Instant) {
        let packet = packet.with_source(device.paired_player());
        self.registry.begin_packet(&packet);
        self.route(packet, now);
    }

    /// Forward `packet` and any service answers it produces.
    pub fn route(&self, packet: VirtualPacket, now: Instant) {
        let mut next = Some(packet);
        while let Some(packet) = next.take() {
            next = self.switch_one(packet, now);
        }
    }

    fn switch_one(&self, packet: VirtualPacket, now: Instant) -> Option<VirtualPacket> {
        let Some(packet) = packet.hop() else {
            self.registry.end_packet(&packet);
            self.count(|s| s.dropped_ttl += 1);
            tracing::trace!(dst = %packet.dst(), "switch dropped: ttl expired");
            return None;
        };

        let dst = packet.dst();
        match dst.kind() {
            AddressKind::Device => {
                self.to_device(packet);
                None
            },
            AddressKind::System => self.to_service(packet, now),
            AddressKind::Player => {
                self.to_external(Some(dst.paired_device()), packet);
                None
            },
            AddressKind::Server => {
                let src = packet.src();
                let owner = match src.kind() {
                    AddressKind::Device => Some(src),
                    AddressKind::Player => Some(src.paired_device()),
                    AddressKind::Server | AddressKind::System => None,
                };
                self.to_external(owner, packet);
                None
            },
        }
    }

    fn to_device(&self, packet: VirtualPacket) {
        let dst = packet.dst();
        let result = match self.sessions().get(&dst) {
            Some(ports) => {
                ports.inbound.try_send(packet).map_err(|e| (e.into_inner(), Dropped::Full))
            },
            None => Err((packet, Dropped::Unknown)),
        };

        match result {
            Ok(()) => self.count(|s| s.to_device += 1),
            Err((packet, reason)) => {
                self.registry.end_packet(&packet);
                self.count_drop(&reason);
                tracing::debug!(%dst, "switch dropped packet for device");
            },
        }
    }

    fn to_service(&self, packet: VirtualPacket, now: Instant) -> Option<VirtualPacket> {
        self.registry.end_packet(&packet);

        let body = if let Some(service) = self.services.get(&packet.dst()) {
            self.count(|s| s.to_service += 1);
            service.handle(&packet, now)
        } else if self.web.at(packet.dst()).is_some() {
            self.count(|s| s.to_service += 1);
            self.web.dispatch(&packet, now)
        } else {
            self.count(|s| s.dropped_unknown += 1);
            tracing::debug!(dst = %packet.dst(), "switch dropped: no such service");
            return None;
        };

        let body = body?;
        let reply = packet.reply(body, self.reply_ttl);
        self.registry.begin_packet(&reply);
        Some(reply)
    }

    fn to_external(&self, owner: Option<VirtualAddress>, packet: VirtualPacket) {
        self.registry.end_packet(&packet);
        let dst = packet.dst();

        let frame = match Payload::Packet(packet).into_frame() {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%dst, %error, "switch could not encode packet");
                self.count(|s| s.dropped_unknown += 1);
                return;
            },
        };

        let result = match owner.and_then(|owner| self.sessions().get(&owner).cloned()) {
            Some(ports) => ports.external.try_send(frame).map_err(|_| Dropped::Full),
            None => Err(Dropped::Unknown),
        };

        match result {
            Ok(()) => self.count(|s| s.to_external += 1),
            Err(reason) => {
                self.count_drop(&reason);
                tracing::debug!(%dst, "switch dropped packet for connection");
            },
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<VirtualAddress, SessionPorts>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, f: impl FnOnce(&mut SwitchStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn count_drop(&self, reason: &Dropped) {
        match reason {
            Dropped::Unknown => self.count(|s| s.dropped_unknown += 1),
            Dropped::Full => self.count(|s| s.dropped_full += 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use mmos_core::{AddressRegistry, RegistryConfig};
    use mmos_proto::{HttpRequest, HttpResponse, http, well_known};

    use super::*;
    use crate::system::EchoService;

    struct Session {
        address: VirtualAddress,
        inbound: mpsc::Receiver<VirtualPacket>,
        external: mpsc::Receiver<Frame>,
    }

    fn setup(sessions: usize) -> (Switch, Vec<Session>) {
        let registry =
            SharedRegistry::new(AddressRegistry::new(RegistryConfig { capacity: 8, first_id: 1 }));
        let switch = Switch::new(registry.clone(), 8).with_service(EchoService).unwrap();

        let sessions = (0..sessions)
            .map(|_| {
                let address = registry.allocate().unwrap();
                let (in_tx, inbound) = mpsc::channel(2);
                let (ext_tx, external) = mpsc::channel(2);
                switch.register(address, SessionPorts { inbound: in_tx, external: ext_tx });
                Session { address, inbound, external }
            })
            .collect();
        (switch, sessions)
    }

    fn packet(src: VirtualAddress, dst: VirtualAddress, ttl: u8) -> VirtualPacket {
        VirtualPacket::new(src, dst, 9, Bytes::from_static(b"hi"), ttl)
    }

    fn as_packet(frame: &Frame) -> VirtualPacket {
        match Payload::from_frame(frame).unwrap() {
            Payload::Packet(packet) => packet,
            other => panic!("expected packet frame, got {other:?}"),
        }
    }

    #[test]
    fn device_to_device_takes_one_hop_and_keeps_flight() {
        let (switch, mut sessions) = setup(2);
        let (a, b) = (sessions[0].address, sessions[1].address);
        let sent = packet(a, b, 4);
        switch.registry().begin_packet(&sent);

        switch.route(sent, Instant::now());

        let arrived = sessions[1].inbound.try_recv().unwrap();
        assert_eq!(arrived.ttl(), 3);
        assert_eq!(arrived.src(), a);
        assert_eq!(switch.registry().in_flight(b), 1);
        assert_eq!(switch.stats().to_device, 1);
    }

    #[test]
    fn expired_ttl_is_dropped_and_released() {
        let (switch, mut sessions) = setup(2);
        let (a, b) = (sessions[0].address, sessions[1].address);
        let sent = packet(a, b, 0);
        switch.registry().begin_packet(&sent);

        switch.route(sent, Instant::now());

        assert!(sessions[1].inbound.try_recv().is_err());
        assert_eq!(switch.registry().in_flight(a), 0);
        assert_eq!(switch.registry().in_flight(b), 0);
        assert_eq!(switch.stats().dropped_ttl, 1);
    }

    #[test]
    fn web_request_is_answered_to_the_device() {
        let (switch, mut sessions) = setup(1);
        let web = SystemServerRegistry::builtin(Instant::now());
        let switch = switch.with_web_servers(web).unwrap();
        let device = sessions[0].address;
        assert!(switch.registry().is_allocated(well_known::TEST_SERVER));

        let body = HttpRequest::get(5, "/api/info").encode().unwrap();
        let request = VirtualPacket::new(device, well_known::TEST_SERVER, http::TAG, body, 4);
        switch.registry().begin_packet(&request);
        switch.route(request, Instant::now());

        let reply = sessions[0].inbound.try_recv().unwrap();
        assert_eq!(reply.src(), well_known::TEST_SERVER);
        assert_eq!(reply.tag().0, http::TAG);
        let response = HttpResponse::decode(reply.payload()).unwrap();
        assert_eq!((response.id, response.status), (5, 200));
        assert_eq!(switch.stats().to_service, 1);
    }

    #[test]
    fn unregistered_device_is_dropped() {
        let (switch, sessions) = setup(2);
        let (a, b) = (sessions[0].address, sessions[1].address);
        assert_eq!(switch.session_count(), 2);
        assert!(switch.unregister(b));
        assert_eq!(switch.session_count(), 1);

        let sent = packet(a, b, 4);
        switch.registry().begin_packet(&sent);
        switch.route(sent, Instant::now());

        assert_eq!(switch.registry().in_flight(b), 0);
        assert_eq!(switch.stats().dropped_unknown, 1);
    }

    #[test]
    fn full_inbound_drops_instead_of_blocking() {
        let (switch, sessions) = setup(2);
        let (a, b) = (sessions[0].address, sessions[1].address);

        for _ in 0..3 {
            let sent = packet(a, b, 4);
            switch.registry().begin_packet(&sent);
            switch.route(sent, Instant::now());
        }

        assert_eq!(switch.stats().to_device, 2);
        assert_eq!(switch.stats().dropped_full, 1);
        assert_eq!(switch.registry().in_flight(b), 2);
    }

    #[test]
    fn system_echo_answers_the_device() {
        let (switch, mut sessions) = setup(1);
        let a = sessions[0].address;
        let sent = packet(a, well_known::ECHO, 8);
        switch.registry().begin_packet(&sent);

        switch.route(sent, Instant::now());

        let reply = sessions[0].inbound.try_recv().unwrap();
        assert_eq!(reply.src(), well_known::ECHO);
        assert_eq!(reply.dst(), a);
        assert_eq!(reply.tag().0, 9);
        assert_eq!(reply.ttl(), 7);
        assert_eq!(reply.payload().as_ref(), b"hi");
        assert_eq!(switch.registry().in_flight(a), 1);
    }

    #[test]
    fn unknown_system_address_is_dropped() {
        let (switch, mut sessions) = setup(1);
        let a = sessions[0].address;
        switch.route(packet(a, VirtualAddress::system(99), 8), Instant::now());

        assert!(sessions[0].inbound.try_recv().is_err());
        assert_eq!(switch.stats().dropped_unknown, 1);
    }

    #[test]
    fn player_and_server_go_to_real_connections() {
        let (switch, mut sessions) = setup(2);
        let (a, b) = (sessions[0].address, sessions[1].address);

        switch.route(packet(a, b.paired_player(), 8), Instant::now());
        switch.route(packet(a, VirtualAddress::server(3), 8), Instant::now());

        let to_player = as_packet(&sessions[1].external.try_recv().unwrap());
        assert_eq!(to_player.dst(), b.paired_player());
        let to_server = as_packet(&sessions[0].external.try_recv().unwrap());
        assert_eq!(to_server.dst(), VirtualAddress::server(3));
        assert_eq!(switch.stats().to_external, 2);
    }

    #[test]
    fn client_packets_are_stamped_with_the_player_address() {
        let (switch, mut sessions) = setup(2);
        let (a, b) = (sessions[0].address, sessions[1].address);

        let forged = packet(VirtualAddress::device(7), b, 8);
        switch.inject_from_client(a, &forged, Instant::now());

        let arrived = sessions[1].inbound.try_recv().unwrap();
        assert_eq!(arrived.src(), a.paired_player());
        assert_eq!(switch.registry().in_flight(b), 1);
        assert_eq!(switch.registry().in_flight(VirtualAddress::device(7)), 0);
    }

    #[test]
    fn client_echo_comes_back_on_its_connection() {
        let (switch, mut sessions) = setup(1);
        let a = sessions[0].address;

        switch.inject_from_client(a, &packet(a, well_known::ECHO, 8), Instant::now());

        let reply = as_packet(&sessions[0].external.try_recv().unwrap());
        assert_eq!(reply.dst(), a.paired_player());
        assert_eq!(reply.payload().as_ref(), b"hi");
    }
}
