//! MMOS server bridge binary.

use std::time::Duration;

use clap::Parser;
use mmos_core::RegistryConfig;
use mmos_server::{BridgeConfig, ServerBridge, SystemEnv, TcpTransport};

#[derive(Debug, Parser)]
#[command(name = "mmos-server", about = "Serve simulated MMOS devices over TCP")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7340")]
    bind: String,

    /// Number of device addresses
    #[arg(long, default_value_t = 1024)]
    capacity: usize,

    /// Kernel tick interval in milliseconds
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// TTL stamped on new packets
    #[arg(long, default_value_t = 8)]
    ttl: u8,

    /// Seconds to wait for in-flight packets after a disconnect
    #[arg(long, default_value_t = 5)]
    drain_timeout_secs: u64,
}

impl Args {
    fn config(&self) -> BridgeConfig {
        let mut config = BridgeConfig {
            registry: RegistryConfig { capacity: self.capacity, ..RegistryConfig::default() },
            tick_interval: Duration::from_millis(self.tick_ms.max(1)),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..BridgeConfig::default()
        };
        config.kernel.network.default_ttl = self.ttl;
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let transport = TcpTransport::bind(args.bind.as_str()).await?;
    let bridge = ServerBridge::new(transport, SystemEnv::new(), args.config())?;

    let handle = bridge.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received");
                handle.shutdown();
            },
            Err(error) => tracing::warn!(%error, "cannot listen for interrupts"),
        }
    });

    bridge.run().await?;
    Ok(())
}
