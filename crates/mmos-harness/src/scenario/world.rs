//! World state for scenario execution.
//!
//! The World owns every device kernel of a scenario and the switch that
//! connects them. Nothing runs on its own: [`World::tick`] advances every
//! kernel once in name order and routes whatever they sent, so a scenario
//! replays identically every time.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use mmos_core::{
    AddressError, AddressRegistry, Kernel, KernelConfig, PersistedLayout, RegistryConfig,
    SharedRegistry,
};
use mmos_proto::{Frame, Payload, VirtualAddress, VirtualPacket};
use mmos_server::{
    EchoService, SessionPorts, Switch, SwitchStats, SystemServerRegistry, TimeService,
};
use tokio::sync::mpsc;

/// Frames one device's player can have waiting.
const PLAYER_QUEUE: usize = 256;

/// A live device and what its player has received.
pub struct SimDevice {
    kernel: Kernel,
    outbound: mpsc::Receiver<VirtualPacket>,
    external: mpsc::Receiver<Frame>,
    received: Vec<VirtualPacket>,
}

impl SimDevice {
    /// The device kernel.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Packets delivered to this device's player, oldest first.
    pub fn received(&self) -> &[VirtualPacket] {
        &self.received
    }
}

/// A device that has been disconnected.
#[derive(Debug, Clone)]
pub struct Departed {
    /// Address the device held
    pub address: VirtualAddress,
    /// Layout returned by the kernel's shutdown
    pub layout: PersistedLayout,
    /// In-flight references dropped by a forced release
    pub abandoned: u32,
    /// Packets its player received while connected
    pub received: Vec<VirtualPacket>,
}

/// World state containing all devices and the switch.
pub struct World {
    devices: BTreeMap<String, SimDevice>,
    departed: BTreeMap<String, Departed>,
    switch: Switch,
    now: Instant,
    tick: Duration,
    ticks: u64,
}

impl World {
    /// Empty world with the built-in system services.
    ///
    /// # Errors
    /// Returns the registry error if a service address cannot be reserved.
    pub fn new(
        registry: RegistryConfig,
        reply_ttl: u8,
        tick: Duration,
    ) -> Result<Self, AddressError> {
        let now = Instant::now();
        let registry = SharedRegistry::new(AddressRegistry::new(registry));
        let switch = Switch::new(registry, reply_ttl)
            .with_service(EchoService)?
            .with_service(TimeService::new(now))?
            .with_web_servers(SystemServerRegistry::builtin(now))?;

        Ok(Self {
            devices: BTreeMap::new(),
            departed: BTreeMap::new(),
            switch,
            now,
            tick,
            ticks: 0,
        })
    }

    /// Allocate an address, boot a kernel with the built-in apps on it and
    /// attach it to the switch.
    ///
    /// # Errors
    /// Returns a message if the name is taken, the pool is exhausted or the
    /// kernel fails to boot.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        config: KernelConfig,
    ) -> Result<VirtualAddress, String> {
        let name = name.into();
        if self.devices.contains_key(&name) || self.departed.contains_key(&name) {
            return Err(format!("device {name} already exists"));
        }

        let registry = self.registry().clone();
        let address = registry.allocate().map_err(|e| format!("device {name}: {e}"))?;
        let mut kernel = Kernel::new(address, mmos_apps::builtin_registry(), config)
            .with_registry(registry.clone());
        let link = kernel.attach_relay();

        if let Err(error) = kernel.boot(None) {
            // The address was never announced to anyone.
            let _ = registry.force_release(address);
            return Err(format!("device {name}: {error}"));
        }

        let (external_tx, external) = mpsc::channel(PLAYER_QUEUE);
        let ports = SessionPorts { inbound: link.inbound, external: external_tx };
        self.switch.register(address, ports);
        tracing::debug!(%name, %address, "device joined");

        self.devices.insert(
            name,
            SimDevice { kernel, outbound: link.outbound, external, received: Vec::new() },
        );
        Ok(address)
    }

    /// Live device by name.
    pub fn device(&self, name: &str) -> Option<&SimDevice> {
        self.devices.get(name)
    }

    /// Disconnected device by name.
    pub fn departed(&self, name: &str) -> Option<&Departed> {
        self.departed.get(name)
    }

    /// Names of the live devices, in tick order.
    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Address of a live or departed device.
    pub fn address(&self, name: &str) -> Option<VirtualAddress> {
        self.devices
            .get(name)
            .map(|d| d.kernel.address())
            .or_else(|| self.departed.get(name).map(|d| d.address))
    }

    /// Payloads a device's player received, as text.
    pub fn received_text(&self, name: &str) -> Vec<String> {
        let received: &[VirtualPacket] = match (self.devices.get(name), self.departed.get(name)) {
            (Some(device), _) => device.received.as_slice(),
            (None, Some(departed)) => departed.received.as_slice(),
            (None, None) => &[],
        };
        received.iter().map(|p| String::from_utf8_lossy(p.payload()).into_owned()).collect()
    }

    /// Registry shared by every kernel and the switch.
    pub fn registry(&self) -> &SharedRegistry {
        self.switch.registry()
    }

    /// Switch counters.
    pub fn switch_stats(&self) -> SwitchStats {
        self.switch.stats()
    }

    /// World ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// In-flight references held by live devices.
    pub fn in_flight(&self) -> u32 {
        let registry = self.registry();
        self.devices.values().map(|d| registry.in_flight(d.kernel.address())).sum()
    }

    /// Packet from `name`'s player to `dst`, entering through the switch
    /// exactly as a real client's would.
    ///
    /// # Errors
    /// Returns a message if `name` is not a live device.
    pub fn inject(
        &mut self,
        name: &str,
        dst: VirtualAddress,
        tag: u16,
        body: &str,
    ) -> Result<(), String> {
        let device = self.devices.get(name).ok_or_else(|| format!("no device {name}"))?;
        let address = device.kernel.address();
        let ttl = device.kernel.network().default_ttl();

        let packet = VirtualPacket::new(address.paired_player(), dst, tag, body.to_string(), ttl);
        self.switch.inject_from_client(address, &packet, self.now);
        Ok(())
    }

    /// Host-driven back navigation on `name`.
    ///
    /// # Errors
    /// Returns a message if `name` is not live or the kernel refuses.
    pub fn go_back(&mut self, name: &str) -> Result<(), String> {
        let device = self.devices.get_mut(name).ok_or_else(|| format!("no device {name}"))?;
        device.kernel.go_back().map_err(|e| format!("device {name}: {e}"))?;
        Ok(())
    }

    /// Tick every live device once and route what they sent.
    ///
    /// Returns the number of packets that moved.
    pub fn tick(&mut self) -> usize {
        self.now += self.tick;
        self.ticks += 1;

        let mut moved = 0;
        for (name, device) in &mut self.devices {
            match device.kernel.tick(self.tick) {
                Ok(report) => {
                    for (request, error) in &report.rejected {
                        tracing::debug!(%name, ?request, %error, "navigation rejected");
                    }
                },
                Err(error) => tracing::warn!(%name, %error, "tick failed"),
            }
            moved += route_outbound(&self.switch, &mut device.outbound, self.now);
        }

        for device in self.devices.values_mut() {
            moved += collect_external(&mut device.external, &mut device.received);
        }
        moved
    }

    /// Tick until no packet moves and nothing is in flight.
    ///
    /// Returns the ticks taken.
    ///
    /// # Errors
    /// Returns a message if the world is still busy after `max_ticks`.
    pub fn settle(&mut self, max_ticks: u32) -> Result<u32, String> {
        for taken in 1..=max_ticks {
            if self.tick() == 0 && self.in_flight() == 0 {
                return Ok(taken);
            }
        }
        Err(format!("world still busy after {max_ticks} ticks ({} in flight)", self.in_flight()))
    }

    /// Disconnect `name` the way a bridge session ends: detach it from the
    /// switch, tick it until nothing references its address (at most
    /// `max_ticks`), shut the kernel down and release the address.
    ///
    /// # Errors
    /// Returns a message if `name` is not live or the kernel cannot shut
    /// down.
    pub fn disconnect(&mut self, name: &str, max_ticks: u32) -> Result<&Departed, String> {
        let mut device = self.devices.remove(name).ok_or_else(|| format!("no device {name}"))?;
        let address = device.kernel.address();
        self.switch.unregister(address);

        for _ in 0..max_ticks {
            if self.registry().in_flight(address) == 0 {
                break;
            }
            self.now += self.tick;
            if let Err(error) = device.kernel.tick(self.tick) {
                tracing::warn!(%name, %error, "drain tick failed");
                break;
            }
            route_outbound(&self.switch, &mut device.outbound, self.now);
        }

        let layout = device.kernel.shutdown().map_err(|e| format!("device {name}: {e}"))?;
        route_outbound(&self.switch, &mut device.outbound, self.now);
        collect_external(&mut device.external, &mut device.received);

        let registry = self.registry();
        let abandoned = match registry.release(address) {
            Ok(()) => 0,
            Err(AddressError::InFlight { .. }) => registry.force_release(address).unwrap_or(0),
            Err(error) => return Err(format!("device {name}: {error}")),
        };
        tracing::debug!(%name, %address, abandoned, "device left");

        let departed = Departed { address, layout, abandoned, received: device.received };
        Ok(self.departed.entry(name.to_string()).or_insert(departed))
    }
}

fn route_outbound(
    switch: &Switch,
    outbound: &mut mpsc::Receiver<VirtualPacket>,
    now: Instant,
) -> usize {
    let mut moved = 0;
    while let Ok(packet) = outbound.try_recv() {
        switch.route(packet, now);
        moved += 1;
    }
    moved
}

fn collect_external(
    external: &mut mpsc::Receiver<Frame>,
    received: &mut Vec<VirtualPacket>,
) -> usize {
    let mut moved = 0;
    while let Ok(frame) = external.try_recv() {
        moved += 1;
        match Payload::from_frame(&frame) {
            Ok(Payload::Packet(packet)) => received.push(packet),
            Ok(other) => tracing::debug!(?other, "player got a non-packet frame"),
            Err(error) => tracing::warn!(%error, "player got an undecodable frame"),
        }
    }
    moved
}
