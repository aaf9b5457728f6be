//! Virtual address allocation.
//!
//! The registry hands out device addresses from a fixed-size pool and keeps
//! a per-address count of packets in flight. An address is only released
//! once nothing references it any more, so a reassigned address can never
//! receive a packet meant for its previous owner.
//!
//! # Allocation order
//!
//! ```text
//! pool: [first_id, first_id + capacity)
//!
//! allocate():  never-used ids first (ascending)
//!              then released ids, oldest release first
//!              else Exhausted
//! ```
//!
//! # In-flight accounting
//!
//! Whoever puts a packet into a relay queue calls `begin_flight` on its
//! source and destination; whoever takes it out for good (delivery, drop,
//! hand-off to a real connection) calls `end_flight`. Addresses outside the
//! registry are ignored by both.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use mmos_proto::{AddressKind, VirtualAddress, VirtualPacket};

use crate::error::AddressError;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Number of device addresses in the pool
    pub capacity: usize,
    /// First device id handed out
    pub first_id: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { capacity: 1024, first_id: 1 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Allocation {
    in_flight: u32,
    pooled: bool,
}

/// Allocator for device addresses.
#[derive(Debug)]
pub struct AddressRegistry {
    config: RegistryConfig,
    next_fresh: u64,
    recycled: VecDeque<u32>,
    allocated: HashMap<VirtualAddress, Allocation>,
    pooled_in_use: usize,
}

impl AddressRegistry {
    /// Create an empty registry.
    ///
    /// The pool never extends past `u32::MAX`; a larger capacity is clamped.
    pub fn new(mut config: RegistryConfig) -> Self {
        let room = u64::from(u32::MAX) - u64::from(config.first_id) + 1;
        if config.capacity as u64 > room {
            tracing::warn!(
                requested = config.capacity,
                first_id = config.first_id,
                room,
                "address pool clamped to the id space"
            );
            config.capacity = room as usize;
        }

        Self {
            next_fresh: u64::from(config.first_id),
            config,
            recycled: VecDeque::new(),
            allocated: HashMap::new(),
            pooled_in_use: 0,
        }
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Number of allocated addresses, reserved ones included.
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Allocate a fresh device address.
    ///
    /// # Errors
    /// Returns `Exhausted` when every pool address is in use.
    pub fn allocate(&mut self) -> Result<VirtualAddress, AddressError> {
        let pool_end = u64::from(self.config.first_id) + self.config.capacity as u64;

        while self.next_fresh < pool_end {
            let address = VirtualAddress::device(self.next_fresh as u32);
            self.next_fresh += 1;
            if !self.allocated.contains_key(&address) {
                return Ok(self.insert_pooled(address));
            }
        }

        while let Some(id) = self.recycled.pop_front() {
            let address = VirtualAddress::device(id);
            if !self.allocated.contains_key(&address) {
                return Ok(self.insert_pooled(address));
            }
        }

        Err(AddressError::Exhausted { capacity: self.config.capacity })
    }

    fn insert_pooled(&mut self, address: VirtualAddress) -> VirtualAddress {
        self.allocated.insert(address, Allocation { in_flight: 0, pooled: true });
        self.pooled_in_use += 1;
        tracing::debug!(%address, in_use = self.pooled_in_use, "address allocated");
        address
    }

    /// Pin a fixed address outside the pool (system services).
    ///
    /// # Errors
    /// Returns `AlreadyAllocated` if the address is taken.
    pub fn reserve(&mut self, address: VirtualAddress) -> Result<(), AddressError> {
        if self.allocated.contains_key(&address) {
            return Err(AddressError::AlreadyAllocated(address));
        }
        self.allocated.insert(address, Allocation::default());
        Ok(())
    }

    /// Release an address with nothing in flight.
    ///
    /// # Errors
    /// - `NotAllocated` if the address is not allocated
    /// - `InFlight` if packets still reference it
    pub fn release(&mut self, address: VirtualAddress) -> Result<(), AddressError> {
        let allocation =
            self.allocated.get(&address).ok_or(AddressError::NotAllocated(address))?;
        if allocation.in_flight > 0 {
            return Err(AddressError::InFlight { address, pending: allocation.in_flight });
        }
        self.remove(address);
        Ok(())
    }

    /// Release an address regardless of packets in flight.
    ///
    /// Only for sessions whose drain timed out. Returns the number of
    /// in-flight references that were abandoned.
    ///
    /// # Errors
    /// Returns `NotAllocated` if the address is not allocated.
    pub fn force_release(&mut self, address: VirtualAddress) -> Result<u32, AddressError> {
        let abandoned =
            self.allocated.get(&address).ok_or(AddressError::NotAllocated(address))?.in_flight;
        if abandoned > 0 {
            tracing::warn!(%address, abandoned, "force-releasing address with packets in flight");
        }
        self.remove(address);
        Ok(abandoned)
    }

    fn remove(&mut self, address: VirtualAddress) {
        if let Some(allocation) = self.allocated.remove(&address)
            && allocation.pooled
        {
            self.pooled_in_use -= 1;
            self.recycled.push_back(address.id());
            tracing::debug!(%address, in_use = self.pooled_in_use, "address released");
        }
    }

    /// Whether `address` is currently allocated. No side effects.
    pub fn is_allocated(&self, address: VirtualAddress) -> bool {
        self.allocated.contains_key(&address)
    }

    /// Packets in flight referencing `address` (0 if unallocated).
    pub fn in_flight(&self, address: VirtualAddress) -> u32 {
        self.allocated.get(&address).map_or(0, |a| a.in_flight)
    }

    /// Count one more packet referencing `address`.
    ///
    /// Returns `false` (and counts nothing) for unallocated addresses.
    pub fn begin_flight(&mut self, address: VirtualAddress) -> bool {
        match self.allocated.get_mut(&address) {
            Some(allocation) => {
                allocation.in_flight = allocation.in_flight.saturating_add(1);
                true
            },
            None => false,
        }
    }

    /// Count one packet referencing `address` as gone.
    pub fn end_flight(&mut self, address: VirtualAddress) {
        if let Some(allocation) = self.allocated.get_mut(&address) {
            allocation.in_flight = allocation.in_flight.saturating_sub(1);
        }
    }

    /// `begin_flight` for both ends of a packet (once if they coincide).
    pub fn begin_packet(&mut self, packet: &VirtualPacket) {
        for address in flight_addresses(packet) {
            self.begin_flight(address);
        }
    }

    /// `end_flight` for both ends of a packet (once if they coincide).
    pub fn end_packet(&mut self, packet: &VirtualPacket) {
        for address in flight_addresses(packet) {
            self.end_flight(address);
        }
    }
}

/// Device addresses a packet pins while in flight.
fn flight_addresses(packet: &VirtualPacket) -> impl Iterator<Item = VirtualAddress> {
    let src = packet.src();
    let dst = packet.dst();
    let dst = (dst != src).then_some(dst);
    std::iter::once(src).chain(dst).filter(|a| a.kind() == AddressKind::Device)
}

impl Default for AddressRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Registry shared between the kernels and the bridge of one simulation.
///
/// Lock scopes never span an `.await`; every method takes and drops the
/// lock internally.
#[derive(Debug, Clone, Default)]
pub struct SharedRegistry {
    inner: Arc<Mutex<AddressRegistry>>,
}

impl SharedRegistry {
    /// Wrap a registry for sharing.
    pub fn new(registry: AddressRegistry) -> Self {
        Self { inner: Arc::new(Mutex::new(registry)) }
    }

    fn lock(&self) -> MutexGuard<'_, AddressRegistry> {
        // Registry updates are single statements, so a poisoned lock still
        // holds consistent state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the registry.
    pub fn with<R>(&self, f: impl FnOnce(&mut AddressRegistry) -> R) -> R {
        f(&mut self.lock())
    }

    /// See [`AddressRegistry::allocate`].
    pub fn allocate(&self) -> Result<VirtualAddress, AddressError> {
        self.lock().allocate()
    }

    /// See [`AddressRegistry::reserve`].
    pub fn reserve(&self, address: VirtualAddress) -> Result<(), AddressError> {
        self.lock().reserve(address)
    }

    /// See [`AddressRegistry::release`].
    pub fn release(&self, address: VirtualAddress) -> Result<(), AddressError> {
        self.lock().release(address)
    }

    /// See [`AddressRegistry::force_release`].
    pub fn force_release(&self, address: VirtualAddress) -> Result<u32, AddressError> {
        self.lock().force_release(address)
    }

    /// See [`AddressRegistry::is_allocated`].
    pub fn is_allocated(&self, address: VirtualAddress) -> bool {
        self.lock().is_allocated(address)
    }

    /// See [`AddressRegistry::in_flight`].
    pub fn in_flight(&self, address: VirtualAddress) -> u32 {
        self.lock().in_flight(address)
    }

    /// See [`AddressRegistry::begin_packet`].
    pub fn begin_packet(&self, packet: &VirtualPacket) {
        self.lock().begin_packet(packet);
    }

    /// See [`AddressRegistry::end_packet`].
    pub fn end_packet(&self, packet: &VirtualPacket) {
        self.lock().end_packet(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(capacity: usize) -> AddressRegistry {
        AddressRegistry::new(RegistryConfig { capacity, first_id: 1 })
    }

    fn packet(src: VirtualAddress, dst: VirtualAddress) -> VirtualPacket {
        VirtualPacket::new(src, dst, 1, Vec::new(), 8)
    }

    #[test]
    fn pool_stops_at_the_last_id() {
        let config = RegistryConfig { capacity: usize::MAX, first_id: u32::MAX - 1 };
        let mut registry = AddressRegistry::new(config);
        assert_eq!(registry.capacity(), 2);

        assert_eq!(registry.allocate().unwrap(), VirtualAddress::device(u32::MAX - 1));
        assert_eq!(registry.allocate().unwrap(), VirtualAddress::device(u32::MAX));
        assert_eq!(registry.allocate(), Err(AddressError::Exhausted { capacity: 2 }));
    }

    #[test]
    fn fresh_ids_come_before_recycled() {
        let mut registry = small(3);
        let a = registry.allocate().unwrap();
        let b = registry.allocate().unwrap();
        registry.release(a).unwrap();

        let c = registry.allocate().unwrap();
        assert_eq!(c, VirtualAddress::device(3), "never-used id first");

        let d = registry.allocate().unwrap();
        assert_eq!(d, a, "then the released one");
        assert_ne!(d, b);
    }

    #[test]
    fn recycled_ids_are_reused_oldest_first() {
        let mut registry = small(3);
        let a = registry.allocate().unwrap();
        let b = registry.allocate().unwrap();
        let c = registry.allocate().unwrap();

        registry.release(b).unwrap();
        registry.release(a).unwrap();
        registry.release(c).unwrap();

        assert_eq!(registry.allocate().unwrap(), b);
        assert_eq!(registry.allocate().unwrap(), a);
        assert_eq!(registry.allocate().unwrap(), c);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut registry = small(2);
        registry.allocate().unwrap();
        registry.allocate().unwrap();
        assert_eq!(registry.allocate(), Err(AddressError::Exhausted { capacity: 2 }));
    }

    #[test]
    fn release_unknown_address_is_invalid() {
        let mut registry = small(2);
        let err = registry.release(VirtualAddress::device(9)).unwrap_err();
        assert!(err.is_invalid_address());
    }

    #[test]
    fn release_with_packets_in_flight_is_invalid() {
        let mut registry = small(2);
        let a = registry.allocate().unwrap();
        let b = registry.allocate().unwrap();

        registry.begin_packet(&packet(a, b));
        assert_eq!(registry.release(b), Err(AddressError::InFlight { address: b, pending: 1 }));
        assert!(registry.is_allocated(b));

        registry.end_packet(&packet(a, b));
        registry.release(b).unwrap();
        assert!(!registry.is_allocated(b));
    }

    #[test]
    fn force_release_reports_abandoned_flights() {
        let mut registry = small(2);
        let a = registry.allocate().unwrap();
        registry.begin_flight(a);
        registry.begin_flight(a);

        assert_eq!(registry.force_release(a), Ok(2));
        assert!(!registry.is_allocated(a));
    }

    #[test]
    fn loopback_packet_counts_once() {
        let mut registry = small(1);
        let a = registry.allocate().unwrap();
        registry.begin_packet(&packet(a, a));
        assert_eq!(registry.in_flight(a), 1);
    }

    #[test]
    fn flights_on_unallocated_addresses_are_ignored() {
        let mut registry = small(1);
        assert!(!registry.begin_flight(VirtualAddress::device(1)));
        registry.end_flight(VirtualAddress::device(1));
        assert_eq!(registry.in_flight(VirtualAddress::device(1)), 0);
    }

    #[test]
    fn reserved_addresses_do_not_use_the_pool() {
        let mut registry = small(1);
        registry.reserve(VirtualAddress::system(1)).unwrap();
        assert_eq!(
            registry.reserve(VirtualAddress::system(1)),
            Err(AddressError::AlreadyAllocated(VirtualAddress::system(1)))
        );

        registry.allocate().unwrap();
        assert_eq!(registry.allocated_count(), 2);

        registry.release(VirtualAddress::system(1)).unwrap();
        assert_eq!(registry.allocate(), Err(AddressError::Exhausted { capacity: 1 }));
    }

    #[test]
    fn allocate_skips_reserved_device_ids() {
        let mut registry = small(3);
        registry.reserve(VirtualAddress::device(1)).unwrap();
        assert_eq!(registry.allocate().unwrap(), VirtualAddress::device(2));
    }

    #[test]
    fn shared_registry_sees_one_state() {
        let shared = SharedRegistry::new(small(4));
        let other = shared.clone();

        let a = shared.allocate().unwrap();
        assert!(other.is_allocated(a));
        other.release(a).unwrap();
        assert!(!shared.is_allocated(a));
    }
}
