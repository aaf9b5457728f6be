//! Bridge configuration.

use std::time::Duration;

use mmos_core::{KernelConfig, RegistryConfig, connection::ConnectionConfig};

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Device address pool
    pub registry: RegistryConfig,
    /// Settings for every session's kernel
    pub kernel: KernelConfig,
    /// Handshake, idle and heartbeat timing
    pub connection: ConnectionConfig,
    /// Time between kernel ticks
    pub tick_interval: Duration,
    /// Upper bound on waiting for in-flight packets after a disconnect
    pub drain_timeout: Duration,
    /// Frames queued for one connection's writer
    pub writer_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            kernel: KernelConfig {
                home_app: Some(mmos_apps::LAUNCHER.to_string()),
                ..KernelConfig::default()
            },
            connection: ConnectionConfig::default(),
            tick_interval: Duration::from_millis(16),
            drain_timeout: Duration::from_secs(5),
            writer_capacity: 256,
        }
    }
}
