//! The handle an app instance uses to reach the outside world.

use bytes::Bytes;
use mmos_proto::{ProtocolTag, VirtualAddress, VirtualPacket};

use crate::{
    app::{AppManifest, AppRegistry, InstanceId},
    browser::BrowserProvider,
    error::NetworkError,
    network::{Endpoint, NetworkStatus, VirtualNetworkStack},
};

/// Navigation request made by an app.
///
/// Requests are queued and applied by the kernel at the end of the tick,
/// never in the middle of a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavRequest {
    /// Push a new instance of an app
    Launch(String),
    /// Dismiss the top frame
    GoBack,
    /// Swap the top frame for a new instance of an app
    ReplaceTop(String),
}

/// Kernel services lent to the lifecycle manager for one transition.
pub struct Services<'a> {
    /// App catalog
    pub apps: &'a AppRegistry,
    /// Device network stack
    pub net: &'a mut VirtualNetworkStack,
    /// Browser capability, if the host has one
    pub browser: Option<&'a dyn BrowserProvider>,
    /// Navigation requests queued during callbacks
    pub nav: &'a mut Vec<NavRequest>,
}

/// Instance-scoped view of the kernel.
///
/// Exposes the instance's own endpoints, navigation requests and optional
/// capabilities. It gives no access to the address registry or to other
/// instances' endpoints.
pub struct AppContext<'a> {
    instance: InstanceId,
    app_id: &'a str,
    apps: &'a AppRegistry,
    net: &'a mut VirtualNetworkStack,
    browser: Option<&'a dyn BrowserProvider>,
    nav: &'a mut Vec<NavRequest>,
}

impl<'a> AppContext<'a> {
    /// Context for `instance` of `app_id`.
    pub fn new(instance: InstanceId, app_id: &'a str, services: &'a mut Services<'_>) -> Self {
        Self {
            instance,
            app_id,
            apps: services.apps,
            net: &mut *services.net,
            browser: services.browser,
            nav: &mut *services.nav,
        }
    }

    /// This instance.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Id of the app this instance runs.
    pub fn app_id(&self) -> &str {
        self.app_id
    }

    /// Address of the device.
    pub fn local_address(&self) -> VirtualAddress {
        self.net.address()
    }

    /// TTL new packets get.
    pub fn default_ttl(&self) -> u8 {
        self.net.default_ttl()
    }

    /// Link availability.
    pub fn network_status(&self) -> NetworkStatus {
        self.net.status()
    }

    /// Bind a tag for this instance.
    pub fn open_endpoint(&mut self, tag: impl Into<ProtocolTag>) -> Result<Endpoint, NetworkError> {
        self.net.open_endpoint(self.instance, tag)
    }

    /// Unbind one of this instance's endpoints.
    pub fn close_endpoint(&mut self, endpoint: &Endpoint) -> Result<(), NetworkError> {
        self.net.close_endpoint(self.instance, endpoint)
    }

    /// Send `payload` from `endpoint` to `dst` on the endpoint's tag.
    pub fn send(
        &mut self,
        endpoint: &Endpoint,
        dst: VirtualAddress,
        payload: impl Into<Bytes>,
    ) -> Result<(), NetworkError> {
        self.net.send_from(self.instance, endpoint, dst, payload)
    }

    /// Reply to `request` from `endpoint`.
    pub fn reply(
        &mut self,
        endpoint: &Endpoint,
        request: &VirtualPacket,
        payload: impl Into<Bytes>,
    ) -> Result<(), NetworkError> {
        self.send(endpoint, request.src(), payload)
    }

    /// Next packet queued on `endpoint`.
    pub fn receive(&mut self, endpoint: &Endpoint) -> Result<Option<VirtualPacket>, NetworkError> {
        self.net.receive(self.instance, endpoint)
    }

    /// Installed apps the device can run, in launcher order.
    ///
    /// Apps that need the browser are hidden when no browser is available,
    /// apps that need the network while the device has no working relay.
    pub fn installed_apps(&self) -> Vec<&AppManifest> {
        let online = self.network_status() == NetworkStatus::Connected;
        self.apps.runnable(self.browser().is_some(), online)
    }

    /// Browser capability, if present and available right now.
    pub fn browser(&self) -> Option<&dyn BrowserProvider> {
        self.browser.filter(|b| b.is_available())
    }

    /// Ask for `app_id` to be launched at the end of the tick.
    pub fn launch(&mut self, app_id: impl Into<String>) {
        self.nav.push(NavRequest::Launch(app_id.into()));
    }

    /// Ask for the top frame to be dismissed at the end of the tick.
    pub fn go_back(&mut self) {
        self.nav.push(NavRequest::GoBack);
    }

    /// Ask for the top frame to be replaced at the end of the tick.
    pub fn replace_top(&mut self, app_id: impl Into<String>) {
        self.nav.push(NavRequest::ReplaceTop(app_id.into()));
    }
}
