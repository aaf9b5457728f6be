//! Scenario builder API.
//!
//! Provides a declarative API for constructing scenario tests that enforce
//! the Oracle Pattern.

use std::time::Duration;

use mmos_core::{KernelConfig, RegistryConfig};
use mmos_proto::VirtualAddress;

use crate::scenario::{OracleFn, World};

/// Ticks a scenario may take to go quiet after its last step.
const SETTLE_TICKS: u32 = 64;

/// Simulated time per world tick.
const TICK: Duration = Duration::from_millis(16);

/// Where a scripted packet goes.
enum Target {
    Device(String),
    Address(VirtualAddress),
}

enum Step {
    Send { from: String, to: Target, tag: u16, body: String },
    Tick(u32),
    Back(String),
    Disconnect(String),
}

/// Scenario builder.
///
/// Add devices, then script what their players send and when. Must call
/// `.oracle()` to get a RunnableScenario that can be executed.
pub struct Scenario {
    name: String,
    registry: RegistryConfig,
    devices: Vec<(String, KernelConfig)>,
    steps: Vec<Step>,
}

impl Scenario {
    /// Create a new scenario with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: RegistryConfig::default(),
            devices: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Use a custom address pool.
    pub fn registry(mut self, config: RegistryConfig) -> Self {
        self.registry = config;
        self
    }

    /// Add a device that boots into the launcher.
    pub fn device(self, name: impl Into<String>) -> Self {
        let home = Some(mmos_apps::LAUNCHER.to_string());
        self.device_with_config(name, KernelConfig { home_app: home, ..KernelConfig::default() })
    }

    /// Add a device with custom kernel configuration.
    pub fn device_with_config(mut self, name: impl Into<String>, config: KernelConfig) -> Self {
        self.devices.push((name.into(), config));
        self
    }

    /// `from`'s player sends `body` to device `to` on `tag`.
    pub fn send(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        tag: u16,
        body: impl Into<String>,
    ) -> Self {
        self.steps.push(Step::Send {
            from: from.into(),
            to: Target::Device(to.into()),
            tag,
            body: body.into(),
        });
        self
    }

    /// `from`'s player sends `body` to a fixed address on `tag`.
    pub fn send_to(
        mut self,
        from: impl Into<String>,
        to: VirtualAddress,
        tag: u16,
        body: impl Into<String>,
    ) -> Self {
        self.steps.push(Step::Send {
            from: from.into(),
            to: Target::Address(to),
            tag,
            body: body.into(),
        });
        self
    }

    /// Run `n` world ticks.
    pub fn tick(mut self, n: u32) -> Self {
        self.steps.push(Step::Tick(n));
        self
    }

    /// Host-driven back navigation on `device`.
    pub fn go_back(mut self, device: impl Into<String>) -> Self {
        self.steps.push(Step::Back(device.into()));
        self
    }

    /// End `device`'s session: drain, shut down, release its address.
    pub fn disconnect(mut self, device: impl Into<String>) -> Self {
        self.steps.push(Step::Disconnect(device.into()));
        self
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Boots every device, plays the steps in order, ticks the world until
    /// no packet is moving, then runs the oracle on the final state.
    ///
    /// # Errors
    /// Returns a message naming the scenario if a step fails, the world
    /// does not settle, or the oracle rejects the outcome.
    pub fn run(self) -> Result<(), String> {
        let Scenario { name, registry, devices, steps } = self.scenario;
        let fail = |error: String| format!("Scenario '{name}': {error}");

        let reply_ttl = devices
            .first()
            .map_or(KernelConfig::default().network.default_ttl, |(_, c)| c.network.default_ttl);
        let mut world = World::new(registry, reply_ttl, TICK).map_err(|e| fail(e.to_string()))?;

        for (device, config) in devices {
            world.add_device(device, config).map_err(fail)?;
        }

        for step in steps {
            match step {
                Step::Send { from, to, tag, body } => {
                    let dst = match to {
                        Target::Address(address) => address,
                        Target::Device(device) => world
                            .address(&device)
                            .ok_or_else(|| fail(format!("no device {device}")))?,
                    };
                    world.inject(&from, dst, tag, &body).map_err(fail)?;
                },
                Step::Tick(n) => {
                    for _ in 0..n {
                        world.tick();
                    }
                },
                Step::Back(device) => world.go_back(&device).map_err(fail)?,
                Step::Disconnect(device) => {
                    world.disconnect(&device, SETTLE_TICKS).map_err(fail)?;
                },
            }
        }

        world.settle(SETTLE_TICKS).map_err(fail)?;
        (self.oracle)(&world).map_err(fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_requires_oracle() {
        // This should compile - oracle provided
        let _scenario = Scenario::new("test").device("alice").oracle(Box::new(|_world| Ok(())));

        // This should NOT compile - no oracle
        // let scenario = Scenario::new("test").device("alice");
        // scenario.run(); // ERROR: no method `run` on type `Scenario`
    }

    #[test]
    fn scenario_creates_devices() {
        let scenario = Scenario::new("test").device("alice").device("bob").oracle(Box::new(|world| {
            assert!(world.device("alice").is_some());
            assert!(world.device("bob").is_some());
            assert_ne!(world.address("alice"), world.address("bob"));
            Ok(())
        }));

        scenario.run().expect("scenario should succeed");
    }

    #[test]
    fn failures_name_the_scenario() {
        let error = Scenario::new("twins")
            .device("alice")
            .device("alice")
            .oracle(Box::new(|_world| Ok(())))
            .run()
            .unwrap_err();

        assert!(error.starts_with("Scenario 'twins':"), "{error}");
    }

    #[test]
    fn oracle_errors_fail_the_run() {
        let result = Scenario::new("picky")
            .device("alice")
            .oracle(Box::new(|_world| Err("nope".to_string())))
            .run();

        assert_eq!(result, Err("Scenario 'picky': nope".to_string()));
    }
}
