//! Virtual network stack of one device.
//!
//! The stack owns the device's endpoint table and decides, for every packet
//! an app sends, whether it is delivered locally, handed to the relay, or
//! dropped. It never blocks and never calls back into apps: delivery only
//! appends to an endpoint's bounded queue, which the owning app drains on its
//! own tick.
//!
//! # Routing
//!
//! ```text
//! send(packet)
//!   ttl == 0 ─────────────────────────────> drop (dropped_ttl)
//!   hop: ttl - 1
//!   dst == local ─────────────────────────> endpoint queue (loopback)
//!   ttl == 0 after the hop ───────────────> drop (dropped_ttl)
//!   dst is an unallocated device ─────────> drop (dropped_unknown_destination)
//!   relay attached and not full ──────────> outbound relay
//!   otherwise ────────────────────────────> drop (dropped_unroutable)
//!
//! drain_inbound()
//!   relay arrivals ───────────────────────> endpoint queue (no extra hop)
//! ```
//!
//! Endpoint queues are bounded; a packet arriving at a full queue is dropped
//! and counted, never blocking the router. None of the drop paths is an
//! error to the sender.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use mmos_proto::{MAX_PACKET_PAYLOAD, ProtocolTag, VirtualAddress, VirtualPacket};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{address::SharedRegistry, app::InstanceId, error::NetworkError};

/// Network stack configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TTL stamped on packets built by [`VirtualNetworkStack::send_from`]
    pub default_ttl: u8,
    /// Packets an endpoint can hold before new arrivals are dropped
    pub endpoint_queue_capacity: usize,
    /// Capacity of each relay channel
    pub relay_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { default_ttl: 8, endpoint_queue_capacity: 64, relay_capacity: 256 }
    }
}

/// Handle to a bound (address, tag) pair.
///
/// Holding a handle is not enough to use it: the stack checks the owning
/// instance on every receive and send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    address: VirtualAddress,
    tag: ProtocolTag,
}

impl Endpoint {
    /// Local address.
    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    /// Bound tag.
    pub fn tag(&self) -> ProtocolTag {
        self.tag
    }
}

/// Per-endpoint queue metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointMetrics {
    /// Packets waiting
    pub queue_depth: usize,
    /// Highest queue depth seen
    pub queue_high_water: usize,
    /// Packets accepted into the queue
    pub total_packets: u64,
    /// Payload bytes accepted into the queue
    pub total_bytes: u64,
    /// Packets refused because the queue was full
    pub dropped: u64,
}

#[derive(Debug)]
struct EndpointSlot {
    owner: InstanceId,
    queue: VecDeque<VirtualPacket>,
    metrics: EndpointMetrics,
}

/// Stack-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    /// Packets handed to `send`
    pub sent: u64,
    /// Packets placed in a local endpoint queue
    pub delivered: u64,
    /// Packets handed to the outbound relay
    pub relayed: u64,
    /// Dropped because the TTL ran out
    pub dropped_ttl: u64,
    /// Dropped because the destination is not an allocated address
    pub dropped_unknown_destination: u64,
    /// Dropped because no endpoint is bound on the tag
    pub dropped_no_listener: u64,
    /// Dropped because the endpoint queue was full
    pub dropped_queue_full: u64,
    /// Dropped because no relay could take the packet
    pub dropped_unroutable: u64,
}

impl NetStats {
    /// Total packets dropped for any reason.
    pub fn dropped(&self) -> u64 {
        self.dropped_ttl
            + self.dropped_unknown_destination
            + self.dropped_no_listener
            + self.dropped_queue_full
            + self.dropped_unroutable
    }
}

/// Link availability as apps see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// No relay was ever attached: loopback only
    Offline,
    /// Relay attached and its consumer alive
    Connected,
    /// Relay attached but its consumer went away
    NoService,
}

/// Bridge side of a stack's relay.
///
/// `outbound` yields packets the device sends off-device; `inbound` accepts
/// packets for the device. Every packet in either channel holds an
/// in-flight reference on its addresses (see [`crate::address`]).
#[derive(Debug)]
pub struct RelayLink {
    /// Packets leaving the device
    pub outbound: mpsc::Receiver<VirtualPacket>,
    /// Packets arriving at the device
    pub inbound: mpsc::Sender<VirtualPacket>,
}

/// Endpoint registry and router for one device.
#[derive(Debug)]
pub struct VirtualNetworkStack {
    address: VirtualAddress,
    config: NetworkConfig,
    endpoints: HashMap<ProtocolTag, EndpointSlot>,
    registry: Option<SharedRegistry>,
    relay_out: Option<mpsc::Sender<VirtualPacket>>,
    relay_in: Option<mpsc::Receiver<VirtualPacket>>,
    stats: NetStats,
}

impl VirtualNetworkStack {
    /// Stack for `address` with no registry and no relay.
    pub fn new(address: VirtualAddress, config: NetworkConfig) -> Self {
        Self {
            address,
            config,
            endpoints: HashMap::new(),
            registry: None,
            relay_out: None,
            relay_in: None,
            stats: NetStats::default(),
        }
    }

    /// Check destinations and count flights against `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Local address.
    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    /// TTL used for packets built by the stack.
    pub fn default_ttl(&self) -> u8 {
        self.config.default_ttl
    }

    /// Counters.
    pub fn stats(&self) -> NetStats {
        self.stats
    }

    /// Link availability.
    pub fn status(&self) -> NetworkStatus {
        match &self.relay_out {
            None => NetworkStatus::Offline,
            Some(tx) if tx.is_closed() => NetworkStatus::NoService,
            Some(_) => NetworkStatus::Connected,
        }
    }

    /// Create the relay channels and return the far side.
    ///
    /// Replaces any previous relay.
    pub fn attach_relay(&mut self) -> RelayLink {
        self.detach_relay();

        let (out_tx, out_rx) = mpsc::channel(self.config.relay_capacity);
        let (in_tx, in_rx) = mpsc::channel(self.config.relay_capacity);
        self.relay_out = Some(out_tx);
        self.relay_in = Some(in_rx);

        RelayLink { outbound: out_rx, inbound: in_tx }
    }

    /// Drop the relay, discarding undelivered arrivals.
    pub fn detach_relay(&mut self) {
        self.relay_out = None;
        if let Some(mut rx) = self.relay_in.take() {
            rx.close();
            while let Ok(packet) = rx.try_recv() {
                self.end_flight(&packet);
                self.stats.dropped_unroutable += 1;
            }
        }
    }

    /// Bind `tag` on the local address for `owner`.
    ///
    /// # Errors
    /// Returns `PortInUse` if the tag is already bound.
    pub fn open_endpoint(
        &mut self,
        owner: InstanceId,
        tag: impl Into<ProtocolTag>,
    ) -> Result<Endpoint, NetworkError> {
        let tag = tag.into();
        if self.endpoints.contains_key(&tag) {
            return Err(NetworkError::PortInUse { address: self.address, tag });
        }

        self.endpoints.insert(
            tag,
            EndpointSlot { owner, queue: VecDeque::new(), metrics: EndpointMetrics::default() },
        );
        tracing::trace!(address = %self.address, %tag, ?owner, "endpoint opened");

        Ok(Endpoint { address: self.address, tag })
    }

    /// Unbind an endpoint, discarding its queue.
    pub fn close_endpoint(
        &mut self,
        owner: InstanceId,
        endpoint: &Endpoint,
    ) -> Result<(), NetworkError> {
        self.owned_slot(owner, endpoint)?;
        self.endpoints.remove(&endpoint.tag);
        Ok(())
    }

    /// Unbind every endpoint `owner` holds. Returns how many were closed.
    pub fn close_owned_by(&mut self, owner: InstanceId) -> usize {
        let before = self.endpoints.len();
        self.endpoints.retain(|_, slot| slot.owner != owner);
        before - self.endpoints.len()
    }

    /// Tags currently bound by `owner`.
    pub fn endpoints_of(&self, owner: InstanceId) -> Vec<ProtocolTag> {
        let mut tags: Vec<_> = self
            .endpoints
            .iter()
            .filter(|(_, slot)| slot.owner == owner)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        tags
    }

    /// Queue metrics of a bound endpoint.
    pub fn endpoint_metrics(&self, endpoint: &Endpoint) -> Option<EndpointMetrics> {
        let slot = self.endpoints.get(&endpoint.tag)?;
        Some(EndpointMetrics { queue_depth: slot.queue.len(), ..slot.metrics })
    }

    /// Route a packet.
    ///
    /// Succeeds even when the packet is dropped; there is no delivery
    /// confirmation.
    ///
    /// # Errors
    /// Returns `PayloadTooLarge` if the payload exceeds the packet limit.
    pub fn send(&mut self, packet: VirtualPacket) -> Result<(), NetworkError> {
        if packet.payload().len() > MAX_PACKET_PAYLOAD {
            return Err(NetworkError::PayloadTooLarge(packet.payload().len()));
        }
        self.stats.sent += 1;

        let Some(packet) = packet.hop() else {
            self.stats.dropped_ttl += 1;
            tracing::trace!(dst = %packet.dst(), "dropped: ttl expired");
            return Ok(());
        };

        if packet.dst() == self.address {
            self.deliver_local(packet);
            return Ok(());
        }

        if packet.ttl() == 0 {
            self.stats.dropped_ttl += 1;
            tracing::trace!(dst = %packet.dst(), "dropped: ttl expired before forwarding");
            return Ok(());
        }

        self.forward(packet);
        Ok(())
    }

    /// Build a packet from a bound endpoint and route it.
    ///
    /// # Errors
    /// - `UnknownEndpoint` / `NotOwner` if `owner` does not hold `endpoint`
    /// - `PayloadTooLarge` if the payload exceeds the packet limit
    pub fn send_from(
        &mut self,
        owner: InstanceId,
        endpoint: &Endpoint,
        dst: VirtualAddress,
        payload: impl Into<Bytes>,
    ) -> Result<(), NetworkError> {
        self.owned_slot(owner, endpoint)?;
        let packet =
            VirtualPacket::new(self.address, dst, endpoint.tag, payload, self.config.default_ttl);
        self.send(packet)
    }

    /// Next queued packet on `endpoint`, oldest first.
    ///
    /// # Errors
    /// Returns `UnknownEndpoint` / `NotOwner` if `owner` does not hold it.
    pub fn receive(
        &mut self,
        owner: InstanceId,
        endpoint: &Endpoint,
    ) -> Result<Option<VirtualPacket>, NetworkError> {
        Ok(self.owned_slot(owner, endpoint)?.queue.pop_front())
    }

    /// Move relay arrivals into endpoint queues.
    ///
    /// Takes at most one relay's worth of packets per call so that a busy
    /// relay cannot stall the tick. Returns the number delivered.
    pub fn drain_inbound(&mut self) -> usize {
        let Some(rx) = self.relay_in.as_mut() else {
            return 0;
        };

        let mut batch = Vec::new();
        while batch.len() < self.config.relay_capacity {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }

        let mut delivered = 0;
        for packet in batch {
            self.end_flight(&packet);
            if packet.dst() != self.address {
                self.stats.dropped_unknown_destination += 1;
                tracing::debug!(dst = %packet.dst(), local = %self.address, "dropped: misrouted");
                continue;
            }
            if self.deliver_local(packet) {
                delivered += 1;
            }
        }
        delivered
    }

    fn owned_slot(
        &mut self,
        owner: InstanceId,
        endpoint: &Endpoint,
    ) -> Result<&mut EndpointSlot, NetworkError> {
        if endpoint.address != self.address {
            return Err(NetworkError::UnknownEndpoint(endpoint.tag));
        }
        let slot = self
            .endpoints
            .get_mut(&endpoint.tag)
            .ok_or(NetworkError::UnknownEndpoint(endpoint.tag))?;
        if slot.owner != owner {
            return Err(NetworkError::NotOwner(endpoint.tag));
        }
        Ok(slot)
    }

    fn deliver_local(&mut self, packet: VirtualPacket) -> bool {
        let Some(slot) = self.endpoints.get_mut(&packet.tag()) else {
            self.stats.dropped_no_listener += 1;
            tracing::trace!(tag = %packet.tag(), "dropped: no listener");
            return false;
        };

        if slot.queue.len() >= self.config.endpoint_queue_capacity {
            slot.metrics.dropped += 1;
            self.stats.dropped_queue_full += 1;
            tracing::debug!(tag = %packet.tag(), "dropped: endpoint queue full");
            return false;
        }

        slot.metrics.total_packets += 1;
        slot.metrics.total_bytes += packet.payload().len() as u64;
        slot.queue.push_back(packet);
        slot.metrics.queue_high_water = slot.metrics.queue_high_water.max(slot.queue.len());
        self.stats.delivered += 1;
        true
    }

    fn forward(&mut self, packet: VirtualPacket) {
        if let Some(registry) = &self.registry {
            let dst = packet.dst();
            let accepted = registry.with(|r| {
                if dst.is_device() && !r.is_allocated(dst) {
                    return false;
                }
                r.begin_packet(&packet);
                true
            });
            if !accepted {
                self.stats.dropped_unknown_destination += 1;
                tracing::trace!(%dst, "dropped: unknown destination");
                return;
            }
        }

        let Some(relay) = &self.relay_out else {
            self.end_flight(&packet);
            self.stats.dropped_unroutable += 1;
            return;
        };

        match relay.try_send(packet) {
            Ok(()) => self.stats.relayed += 1,
            Err(TrySendError::Full(packet) | TrySendError::Closed(packet)) => {
                self.end_flight(&packet);
                self.stats.dropped_unroutable += 1;
                tracing::debug!(dst = %packet.dst(), "dropped: relay unavailable");
            },
        }
    }

    fn end_flight(&self, packet: &VirtualPacket) {
        if let Some(registry) = &self.registry {
            registry.end_packet(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressRegistry, RegistryConfig};

    const OWNER: InstanceId = InstanceId(1);
    const OTHER: InstanceId = InstanceId(2);

    fn stack(address: VirtualAddress) -> VirtualNetworkStack {
        VirtualNetworkStack::new(address, NetworkConfig::default())
    }

    #[test]
    fn loopback_consumes_exactly_one_hop() {
        let a = VirtualAddress::device(1);
        let mut net = stack(a);
        let endpoint = net.open_endpoint(OWNER, 80).unwrap();

        net.send(VirtualPacket::new(a, a, 80, Bytes::from_static(b"x"), 4)).unwrap();

        let received = net.receive(OWNER, &endpoint).unwrap().unwrap();
        assert_eq!(received.payload().as_ref(), b"x");
        assert_eq!(received.ttl(), 3);
        assert_eq!(net.receive(OWNER, &endpoint).unwrap(), None);
    }

    #[test]
    fn ttl_zero_is_never_delivered() {
        let a = VirtualAddress::device(1);
        let mut net = stack(a);
        let endpoint = net.open_endpoint(OWNER, 80).unwrap();

        net.send(VirtualPacket::new(a, a, 80, Vec::new(), 0)).unwrap();

        assert_eq!(net.receive(OWNER, &endpoint).unwrap(), None);
        assert_eq!(net.stats().dropped_ttl, 1);
    }

    #[test]
    fn ttl_one_still_loops_back() {
        let a = VirtualAddress::device(1);
        let mut net = stack(a);
        let endpoint = net.open_endpoint(OWNER, 80).unwrap();

        net.send(VirtualPacket::new(a, a, 80, Vec::new(), 1)).unwrap();
        assert_eq!(net.receive(OWNER, &endpoint).unwrap().unwrap().ttl(), 0);
    }

    #[test]
    fn port_in_use() {
        let mut net = stack(VirtualAddress::device(1));
        net.open_endpoint(OWNER, 80).unwrap();
        assert!(matches!(net.open_endpoint(OTHER, 80), Err(NetworkError::PortInUse { .. })));
    }

    #[test]
    fn foreign_instance_cannot_receive() {
        let mut net = stack(VirtualAddress::device(1));
        let endpoint = net.open_endpoint(OWNER, 80).unwrap();
        assert_eq!(net.receive(OTHER, &endpoint), Err(NetworkError::NotOwner(ProtocolTag(80))));
        assert!(matches!(
            net.send_from(OTHER, &endpoint, VirtualAddress::device(1), Vec::new()),
            Err(NetworkError::NotOwner(_))
        ));
    }

    #[test]
    fn queue_bound_drops_newest() {
        let a = VirtualAddress::device(1);
        let config = NetworkConfig { endpoint_queue_capacity: 3, ..Default::default() };
        let mut net = VirtualNetworkStack::new(a, config);
        let endpoint = net.open_endpoint(OWNER, 80).unwrap();

        for i in 0..4u8 {
            net.send(VirtualPacket::new(a, a, 80, vec![i], 8)).unwrap();
        }

        let drained: Vec<u8> = std::iter::from_fn(|| net.receive(OWNER, &endpoint).unwrap())
            .map(|p| p.payload()[0])
            .collect();
        assert_eq!(drained, vec![0, 1, 2]);
        assert_eq!(net.stats().dropped_queue_full, 1);
        assert_eq!(net.endpoint_metrics(&endpoint).unwrap().queue_high_water, 3);
    }

    #[test]
    fn send_to_unallocated_device_is_silently_dropped() {
        let registry = SharedRegistry::new(AddressRegistry::new(RegistryConfig::default()));
        let a = registry.allocate().unwrap();
        let mut net = stack(a).with_registry(registry);
        let mut relay = net.attach_relay();

        net.send(VirtualPacket::new(a, VirtualAddress::device(999), 80, Vec::new(), 8)).unwrap();

        assert_eq!(net.stats().dropped_unknown_destination, 1);
        assert!(relay.outbound.try_recv().is_err());
    }

    #[test]
    fn no_relay_means_unroutable() {
        let a = VirtualAddress::device(1);
        let mut net = stack(a);
        net.send(VirtualPacket::new(a, VirtualAddress::device(2), 80, Vec::new(), 8)).unwrap();
        assert_eq!(net.stats().dropped_unroutable, 1);
        assert_eq!(net.status(), NetworkStatus::Offline);
    }

    #[test]
    fn last_hop_is_never_forwarded() {
        let registry = SharedRegistry::new(AddressRegistry::new(RegistryConfig::default()));
        let a = registry.allocate().unwrap();
        let b = registry.allocate().unwrap();
        let mut net = stack(a).with_registry(registry.clone());
        let mut link = net.attach_relay();

        net.send(VirtualPacket::new(a, b, 7, Vec::new(), 1)).unwrap();

        assert!(link.outbound.try_recv().is_err());
        assert_eq!(net.stats().relayed, 0);
        assert_eq!(net.stats().dropped_ttl, 1);
        assert_eq!(registry.in_flight(a), 0);
        assert_eq!(registry.in_flight(b), 0);
    }

    #[test]
    fn relay_round_trip_tracks_flights() {
        let registry = SharedRegistry::new(AddressRegistry::new(RegistryConfig::default()));
        let a = registry.allocate().unwrap();
        let b = registry.allocate().unwrap();

        let mut net_a = stack(a).with_registry(registry.clone());
        let mut net_b = stack(b).with_registry(registry.clone());
        let mut link_a = net_a.attach_relay();
        let link_b = net_b.attach_relay();
        let endpoint = net_b.open_endpoint(OWNER, 7).unwrap();

        net_a.send(VirtualPacket::new(a, b, 7, Bytes::from_static(b"hi"), 8)).unwrap();
        assert_eq!(registry.in_flight(b), 1);
        assert!(registry.release(b).is_err(), "packet to b is still in flight");

        let packet = link_a.outbound.try_recv().unwrap();
        assert_eq!(packet.ttl(), 7);
        link_b.inbound.try_send(packet).unwrap();

        assert_eq!(net_b.drain_inbound(), 1);
        assert_eq!(registry.in_flight(b), 0);
        assert_eq!(net_b.receive(OWNER, &endpoint).unwrap().unwrap().payload().as_ref(), b"hi");
    }

    #[test]
    fn misrouted_arrivals_are_dropped() {
        let a = VirtualAddress::device(1);
        let mut net = stack(a);
        let link = net.attach_relay();
        net.open_endpoint(OWNER, 7).unwrap();

        link.inbound
            .try_send(VirtualPacket::new(a, VirtualAddress::device(5), 7, Vec::new(), 8))
            .unwrap();

        assert_eq!(net.drain_inbound(), 0);
        assert_eq!(net.stats().dropped_unknown_destination, 1);
    }

    #[test]
    fn status_follows_relay_consumer() {
        let mut net = stack(VirtualAddress::device(1));
        let link = net.attach_relay();
        assert_eq!(net.status(), NetworkStatus::Connected);
        drop(link);
        assert_eq!(net.status(), NetworkStatus::NoService);
    }

    #[test]
    fn closing_an_owner_releases_only_its_endpoints() {
        let mut net = stack(VirtualAddress::device(1));
        net.open_endpoint(OWNER, 1).unwrap();
        net.open_endpoint(OWNER, 2).unwrap();
        let kept = net.open_endpoint(OTHER, 3).unwrap();

        assert_eq!(net.close_owned_by(OWNER), 2);
        assert_eq!(net.endpoints_of(OWNER), Vec::<ProtocolTag>::new());
        assert_eq!(net.endpoints_of(OTHER), vec![kept.tag()]);
        net.open_endpoint(OTHER, 1).unwrap();
    }

    #[test]
    fn per_source_order_survives_interleaving() {
        let a = VirtualAddress::device(1);
        let b = VirtualAddress::device(2);
        let mut net = stack(b);
        let link = net.attach_relay();
        let endpoint = net.open_endpoint(OWNER, 9).unwrap();

        for i in 0..5u8 {
            link.inbound.try_send(VirtualPacket::new(a, b, 9, vec![i], 8)).unwrap();
            net.send(VirtualPacket::new(b, b, 9, vec![100 + i], 8)).unwrap();
        }
        net.drain_inbound();

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        while let Some(packet) = net.receive(OWNER, &endpoint).unwrap() {
            let bucket = if packet.src() == a { &mut from_a } else { &mut from_b };
            bucket.push(packet.payload()[0]);
        }
        assert_eq!(from_a, vec![0, 1, 2, 3, 4]);
        assert_eq!(from_b, vec![100, 101, 102, 103, 104]);
    }
}
