//! Scenario testing.
//!
//! A scenario names its devices, scripts what their players send, and ends
//! with an oracle that checks the settled world:
//!
//! ```text
//! Scenario::new("name")
//!     .device("alice")            boots into the launcher
//!     .send("alice", "bob", tag, "body")
//!     .tick(3)
//!     .disconnect("bob")
//!     .oracle(check)              mandatory
//!     .run()                      settle, then check(&world)
//! ```

mod builder;
mod world;

pub use builder::{RunnableScenario, Scenario};
pub use world::{Departed, SimDevice, World};

/// Final-state check for a scenario.
pub type OracleFn = Box<dyn FnOnce(&World) -> Result<(), String>>;

/// Reusable oracles.
pub mod oracle {
    use super::OracleFn;

    /// Every oracle must pass, checked in order.
    pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
        Box::new(move |world| oracles.into_iter().try_for_each(|oracle| oracle(world)))
    }

    /// No live device has a packet in flight.
    pub fn nothing_in_flight() -> OracleFn {
        Box::new(|world| match world.in_flight() {
            0 => Ok(()),
            pending => Err(format!("{pending} packets still in flight")),
        })
    }

    /// `app` is the focused app on `device`.
    pub fn focused(device: &str, app: &str) -> OracleFn {
        let (device, app) = (device.to_string(), app.to_string());
        Box::new(move |world| {
            let top = world
                .device(&device)
                .ok_or_else(|| format!("no device {device}"))?
                .kernel()
                .screens()
                .top()
                .map(|frame| frame.app_id().to_string());
            match top {
                Some(top) if top == app => Ok(()),
                other => Err(format!("{device}: expected {app} on top, found {other:?}")),
            }
        })
    }

    /// `device`'s player received exactly `expected`, in order.
    pub fn received(device: &str, expected: &[&str]) -> OracleFn {
        let device = device.to_string();
        let expected: Vec<String> = expected.iter().map(ToString::to_string).collect();
        Box::new(move |world| {
            let got = world.received_text(&device);
            if got == expected {
                Ok(())
            } else {
                Err(format!("{device}: expected {expected:?}, received {got:?}"))
            }
        })
    }

    /// The address `device` held is free again.
    pub fn released(device: &str) -> OracleFn {
        let device = device.to_string();
        Box::new(move |world| {
            let address = world.address(&device).ok_or_else(|| format!("no device {device}"))?;
            if world.registry().is_allocated(address) {
                Err(format!("{device}: {address} is still allocated"))
            } else {
                Ok(())
            }
        })
    }
}
