//! Kernel: the composition root of one simulated device.
//!
//! A kernel owns exactly one network stack, one app catalog and one
//! lifecycle manager, and borrows a handle to the address registry shared by
//! the simulation. There is no global kernel; hosts create as many as they
//! need.
//!
//! # Tick
//!
//! ```text
//! tick(elapsed)
//!   1. drain inbound relay  ──> endpoint queues
//!   2. focused app on_tick  ──> may send, may queue NavRequests
//!   3. apply NavRequests    ──> launch / go_back / replace_top
//!   4. stack empty?         ──> relaunch home app (if configured)
//! ```
//!
//! Navigation requested during step 2 is deferred to step 3, so an app never
//! observes the stack changing under its own callback.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use mmos_proto::{ProtocolTag, VirtualAddress};

use crate::{
    address::SharedRegistry,
    app::{AppManifest, AppRegistry},
    browser::BrowserProvider,
    context::{NavRequest, Services},
    error::{KernelError, LifecycleError},
    layout::PersistedLayout,
    network::{NetworkConfig, NetworkStatus, RelayLink, VirtualNetworkStack},
    screen::{LifecycleEvent, ManagerState, ScreenLifecycleManager},
};

/// Kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Network stack settings
    pub network: NetworkConfig,
    /// App launched at boot and whenever the stack empties
    pub home_app: Option<String>,
    /// Navigation requests applied per tick; the rest wait for the next one
    pub max_nav_per_tick: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { network: NetworkConfig::default(), home_app: None, max_nav_per_tick: 16 }
    }
}

/// Kernel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// Constructed, not booted
    Created,
    /// Booted and ticking
    Running,
    /// Shut down; terminal
    ShutDown,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Tick number, starting at 1
    pub tick: u64,
    /// Relay packets delivered to endpoints
    pub delivered: usize,
    /// Whether a focused app ran `on_tick`
    pub ticked_app: bool,
    /// Lifecycle events from applied navigation, in order
    pub events: Vec<LifecycleEvent>,
    /// Navigation requests that failed
    pub rejected: Vec<(NavRequest, LifecycleError)>,
}

/// One simulated device.
#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
    state: KernelState,
    apps: AppRegistry,
    net: VirtualNetworkStack,
    screens: ScreenLifecycleManager,
    browser: Option<Arc<dyn BrowserProvider>>,
    nav: Vec<NavRequest>,
    app_state: BTreeMap<String, serde_json::Value>,
    ticks: u64,
    uptime: Duration,
}

impl Kernel {
    /// Kernel for the device at `address` running apps from `apps`.
    pub fn new(address: VirtualAddress, apps: AppRegistry, config: KernelConfig) -> Self {
        let net = VirtualNetworkStack::new(address, config.network.clone());
        Self {
            config,
            state: KernelState::Created,
            apps,
            net,
            screens: ScreenLifecycleManager::new(),
            browser: None,
            nav: Vec::new(),
            app_state: BTreeMap::new(),
            ticks: 0,
            uptime: Duration::ZERO,
        }
    }

    /// Check destinations and count flights against a shared registry.
    #[must_use]
    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.net = self.net.with_registry(registry);
        self
    }

    /// Give apps a browser engine.
    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn BrowserProvider>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Connect the network stack to a relay; see [`VirtualNetworkStack::attach_relay`].
    pub fn attach_relay(&mut self) -> RelayLink {
        self.net.attach_relay()
    }

    /// Lifecycle state.
    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Device address.
    pub fn address(&self) -> VirtualAddress {
        self.net.address()
    }

    /// Network stack.
    pub fn network(&self) -> &VirtualNetworkStack {
        &self.net
    }

    /// Mutable network stack, for hosts that inject or send directly.
    pub fn network_mut(&mut self) -> &mut VirtualNetworkStack {
        &mut self.net
    }

    /// Navigation stack.
    pub fn screens(&self) -> &ScreenLifecycleManager {
        &self.screens
    }

    /// Endpoint tags held by the frame at `index`, bottom first.
    pub fn frame_endpoints(&self, index: usize) -> Vec<ProtocolTag> {
        self.screens
            .frames()
            .get(index)
            .map(|frame| self.net.endpoints_of(frame.instance()))
            .unwrap_or_default()
    }

    /// App catalog.
    pub fn apps(&self) -> &AppRegistry {
        &self.apps
    }

    /// Ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Sum of `elapsed` over all ticks.
    pub fn uptime(&self) -> Duration {
        self.uptime
    }

    /// Apps the launcher should show, in order.
    ///
    /// Apps needing the browser are hidden while no browser is available,
    /// apps needing the network while the relay is not connected.
    pub fn available_apps(&self) -> Vec<&AppManifest> {
        let browser = self.browser.as_ref().is_some_and(|b| b.is_available());
        let online = self.net.status() == NetworkStatus::Connected;
        self.apps.runnable(browser, online)
    }

    /// Load the persisted layout and launch the home app.
    ///
    /// A missing or unusable layout falls back to defaults. If the home app
    /// cannot be launched the kernel still runs with an empty stack and the
    /// error is returned.
    pub fn boot(&mut self, persisted: Option<&[u8]>) -> Result<Vec<LifecycleEvent>, KernelError> {
        self.ensure_state(KernelState::Created, "boot")?;

        let layout = PersistedLayout::decode(persisted);
        self.apps.apply_order(&layout.app_order);
        self.app_state = layout.app_state;
        self.state = KernelState::Running;
        tracing::info!(address = %self.address(), apps = self.apps.len(), "kernel booted");

        let Some(home) = self.config.home_app.clone() else {
            return Ok(Vec::new());
        };
        Ok(self.apply(&NavRequest::Launch(home))?)
    }

    /// Advance the device by one tick.
    pub fn tick(&mut self, elapsed: Duration) -> Result<TickReport, KernelError> {
        self.ensure_state(KernelState::Running, "tick")?;
        self.ticks += 1;
        self.uptime += elapsed;

        let delivered = self.net.drain_inbound();
        let ticked_app =
            self.with_services(|screens, services, _| screens.tick_active(elapsed, services));

        let mut report =
            TickReport { tick: self.ticks, delivered, ticked_app, ..Default::default() };

        let mut budget = self.config.max_nav_per_tick;
        while budget > 0 && !self.nav.is_empty() {
            budget -= 1;
            let request = self.nav.remove(0);
            match self.apply(&request) {
                Ok(events) => report.events.extend(events),
                Err(error) => {
                    tracing::warn!(?request, %error, "navigation request rejected");
                    report.rejected.push((request, error));
                },
            }
        }
        if !self.nav.is_empty() {
            tracing::debug!(pending = self.nav.len(), "navigation requests carried to next tick");
        }

        if self.screens.state() == ManagerState::Idle
            && let Some(home) = self.config.home_app.clone()
        {
            match self.apply(&NavRequest::Launch(home)) {
                Ok(events) => report.events.extend(events),
                Err(error) => tracing::warn!(%error, "home app relaunch failed"),
            }
        }

        Ok(report)
    }

    /// Host-driven launch, applied immediately.
    pub fn launch(&mut self, app_id: &str) -> Result<Vec<LifecycleEvent>, KernelError> {
        self.ensure_state(KernelState::Running, "launch")?;
        Ok(self.apply(&NavRequest::Launch(app_id.to_string()))?)
    }

    /// Host-driven back navigation, applied immediately.
    ///
    /// The home app, if any, comes back on the next tick.
    pub fn go_back(&mut self) -> Result<Vec<LifecycleEvent>, KernelError> {
        self.ensure_state(KernelState::Running, "go_back")?;
        Ok(self.apply(&NavRequest::GoBack)?)
    }

    /// Host-driven replace, applied immediately.
    pub fn replace_top(&mut self, app_id: &str) -> Result<Vec<LifecycleEvent>, KernelError> {
        self.ensure_state(KernelState::Running, "replace_top")?;
        Ok(self.apply(&NavRequest::ReplaceTop(app_id.to_string()))?)
    }

    /// Show a system overlay over the focused app.
    pub fn show_overlay(&mut self) -> Result<Vec<LifecycleEvent>, KernelError> {
        self.ensure_state(KernelState::Running, "show_overlay")?;
        Ok(self.with_services(|screens, services, _| screens.show_overlay(services))?)
    }

    /// Dismiss the system overlay.
    pub fn dismiss_overlay(&mut self) -> Result<Vec<LifecycleEvent>, KernelError> {
        self.ensure_state(KernelState::Running, "dismiss_overlay")?;
        Ok(self.with_services(|screens, services, _| screens.dismiss_overlay(services))?)
    }

    /// Current layout, including live state of running apps.
    pub fn save_state(&self) -> PersistedLayout {
        let mut app_state = self.app_state.clone();
        for frame in self.screens.frames() {
            if let Some(state) = frame.save_state() {
                app_state.insert(frame.app_id().to_string(), state);
            }
        }
        PersistedLayout::new(self.apps.order().to_vec(), app_state)
    }

    /// Dismiss every frame top to bottom and return the final layout.
    pub fn shutdown(&mut self) -> Result<PersistedLayout, KernelError> {
        self.ensure_state(KernelState::Running, "shutdown")?;

        let events = self.with_services(|screens, services, _| screens.dismiss_all(services));
        self.absorb(&events);
        self.nav.clear();
        self.net.detach_relay();
        self.state = KernelState::ShutDown;

        tracing::info!(address = %self.address(), ticks = self.ticks, "kernel shut down");
        Ok(self.save_state())
    }

    fn ensure_state(
        &self,
        expected: KernelState,
        operation: &'static str,
    ) -> Result<(), KernelError> {
        if self.state != expected {
            return Err(KernelError::InvalidState { state: self.state, operation });
        }
        Ok(())
    }

    fn apply(&mut self, request: &NavRequest) -> Result<Vec<LifecycleEvent>, LifecycleError> {
        let events = self.with_services(|screens, services, saved| match request {
            NavRequest::Launch(app_id) => screens.launch(app_id, services, saved.get(app_id)),
            NavRequest::GoBack => screens.go_back(services),
            NavRequest::ReplaceTop(app_id) => {
                screens.replace_top(app_id, services, saved.get(app_id))
            },
        })?;
        self.absorb(&events);
        Ok(events)
    }

    fn absorb(&mut self, events: &[LifecycleEvent]) {
        for event in events {
            if let LifecycleEvent::Stopped { app_id, saved_state: Some(state), .. } = event {
                self.app_state.insert(app_id.clone(), state.clone());
            }
        }
    }

    fn with_services<R>(
        &mut self,
        f: impl FnOnce(
            &mut ScreenLifecycleManager,
            &mut Services<'_>,
            &BTreeMap<String, serde_json::Value>,
        ) -> R,
    ) -> R {
        let Self { apps, net, screens, browser, nav, app_state, .. } = self;
        let mut services = Services { apps, net, browser: browser.as_deref(), nav };
        f(screens, &mut services, app_state)
    }
}
