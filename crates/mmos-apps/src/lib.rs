//! Built-in MMOS apps
//!
//! Headless renditions of the apps every device ships with. There is no
//! screen, so each app is driven by packets on a well-known protocol tag and
//! answers the sender on the same tag.
//!
//! | App          | Tag | Request            | Reply                      |
//! |--------------|-----|--------------------|----------------------------|
//! | `launcher`   | 1   | `open <id>`, `list`, `recent` | `ok`, app ids, error text |
//! | `echo`       | 7   | anything           | the same bytes             |
//! | `clock`      | 13  | anything           | foreground time `HH:MM:SS` |
//! | `calculator` | 20  | key presses        | the display                |
//! | `browser`    | 80  | a URL              | page, page handle or error |
//!
//! The launcher is the home app: install it and set `home_app` to
//! [`LAUNCHER`] so the device always comes back to it.

use mmos_core::{AppContext, AppError, AppRegistry, Endpoint};
use mmos_proto::VirtualPacket;

pub mod browser;
pub mod calculator;
pub mod clock;
pub mod echo;
pub mod launcher;

pub use browser::BrowserApp;
pub use calculator::{Calculator, CalculatorApp, Key};
pub use clock::ClockApp;
pub use echo::EchoApp;
pub use launcher::LauncherApp;

/// App id of the launcher.
pub const LAUNCHER: &str = "launcher";
/// App id of the echo app.
pub const ECHO: &str = "echo";
/// App id of the clock.
pub const CLOCK: &str = "clock";
/// App id of the calculator.
pub const CALCULATOR: &str = "calculator";
/// App id of the browser.
pub const BROWSER: &str = "browser";

/// Protocol tags the built-in apps listen on.
pub mod tags {
    /// Launcher control commands
    pub const CONTROL: u16 = 1;
    /// Echo requests
    pub const ECHO: u16 = 7;
    /// Clock queries
    pub const CLOCK: u16 = 13;
    /// Calculator key presses
    pub const CALCULATOR: u16 = 20;
    /// Browser navigation
    pub const BROWSER: u16 = 80;
}

/// Install every built-in app, launcher first.
///
/// # Errors
/// Returns `Duplicate` if one of the ids is already taken.
pub fn install_builtin(apps: &mut AppRegistry) -> Result<(), AppError> {
    apps.install(launcher::manifest(), Box::new(|| Box::<LauncherApp>::default()))?;
    apps.install(calculator::manifest(), Box::new(|| Box::<CalculatorApp>::default()))?;
    apps.install(clock::manifest(), Box::new(|| Box::<ClockApp>::default()))?;
    apps.install(echo::manifest(), Box::new(|| Box::<EchoApp>::default()))?;
    apps.install(browser::manifest(), Box::new(|| Box::<BrowserApp>::default()))?;
    Ok(())
}

/// Catalog holding just the built-in apps.
pub fn builtin_registry() -> AppRegistry {
    let mut apps = AppRegistry::new();
    // Installing into an empty catalog cannot collide.
    if let Err(error) = install_builtin(&mut apps) {
        tracing::error!(%error, "built-in app catalog is inconsistent");
    }
    apps
}

/// Open `tag` for the calling instance, logging instead of failing.
///
/// A second instance of the same app finds the tag taken and runs without
/// an endpoint until the first one is dismissed.
fn open(ctx: &mut AppContext<'_>, tag: u16) -> Option<Endpoint> {
    match ctx.open_endpoint(tag) {
        Ok(endpoint) => Some(endpoint),
        Err(error) => {
            tracing::warn!(
                app = ctx.app_id(),
                instance = %ctx.instance(),
                %error,
                "endpoint unavailable"
            );
            None
        },
    }
}

/// Every packet waiting on `endpoint`.
fn drain(ctx: &mut AppContext<'_>, endpoint: &Endpoint) -> Vec<VirtualPacket> {
    let mut packets = Vec::new();
    while let Ok(Some(packet)) = ctx.receive(endpoint) {
        packets.push(packet);
    }
    packets
}

/// Answer `request`, logging failures.
fn answer(
    ctx: &mut AppContext<'_>,
    endpoint: &Endpoint,
    request: &VirtualPacket,
    body: impl Into<bytes::Bytes>,
) {
    if let Err(error) = ctx.reply(endpoint, request, body) {
        tracing::debug!(app = ctx.app_id(), %error, "reply failed");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{sync::Arc, time::Duration};

    use mmos_core::{BrowserProvider, Kernel, KernelConfig, RelayLink};
    use mmos_proto::{VirtualAddress, VirtualPacket};

    /// A kernel with the built-in apps and a relay the test drives by hand.
    pub struct Device {
        pub kernel: Kernel,
        pub link: RelayLink,
        pub peer: VirtualAddress,
    }

    impl Device {
        pub fn boot(browser: Option<Arc<dyn BrowserProvider>>) -> Self {
            Self::restore(browser, None)
        }

        /// Boot from a layout saved by an earlier shutdown.
        pub fn restore(browser: Option<Arc<dyn BrowserProvider>>, layout: Option<&[u8]>) -> Self {
            let config =
                KernelConfig { home_app: Some(super::LAUNCHER.to_string()), ..Default::default() };
            let apps = super::builtin_registry();
            let mut kernel = Kernel::new(VirtualAddress::device(1), apps, config);
            if let Some(browser) = browser {
                kernel = kernel.with_browser(browser);
            }
            let link = kernel.attach_relay();
            kernel.boot(layout).unwrap();
            Self { kernel, link, peer: VirtualAddress::device(2) }
        }

        /// Send `body` to the device on `tag`, tick once, return the replies.
        pub fn request(&mut self, tag: u16, body: &str) -> Vec<String> {
            self.send(tag, body);
            self.replies(tag)
        }

        /// Send `body` to the device on `tag` and tick once.
        pub fn send(&mut self, tag: u16, body: &str) {
            let packet = VirtualPacket::new(
                self.peer,
                self.kernel.address(),
                tag,
                body.as_bytes().to_vec(),
                8,
            );
            self.deliver(packet);
        }

        /// Hand `packet` to the device's relay and tick once.
        pub fn deliver(&mut self, packet: VirtualPacket) {
            self.link.inbound.try_send(packet).unwrap();
            self.tick(Duration::from_millis(16));
        }

        /// Everything the device has sent since the last call.
        pub fn sent(&mut self) -> Vec<VirtualPacket> {
            let mut packets = Vec::new();
            while let Ok(packet) = self.link.outbound.try_recv() {
                packets.push(packet);
            }
            packets
        }

        /// Text answers to the peer on `tag` since the last call.
        pub fn replies(&mut self, tag: u16) -> Vec<String> {
            self.sent()
                .into_iter()
                .map(|reply| {
                    assert_eq!(reply.dst(), self.peer);
                    assert_eq!(reply.tag().0, tag);
                    String::from_utf8(reply.payload().to_vec()).unwrap()
                })
                .collect()
        }

        pub fn tick(&mut self, elapsed: Duration) {
            self.kernel.tick(elapsed).unwrap();
        }

        pub fn top(&self) -> &str {
            self.kernel.screens().top().unwrap().app_id()
        }
    }
}
