//! MMOS server bridge
//!
//! Accepts real connections and gives each one its own simulated device: a
//! virtual address from the shared registry and a [`mmos_core::Kernel`]
//! running the built-in apps. Packets move between the connection, the
//! device kernels and the system services through the [`Switch`].
//!
//! # Session tasks
//!
//! ```text
//!  socket ──reader──> frames ──┐
//!                              ▼
//!                     session loop (Connection + Kernel::tick)
//!                              │ inject_from_client
//!                              ▼
//!  kernel outbound ──relay──> Switch ──> device inbound / system service /
//!                                        external writer ──writer──> socket
//! ```
//!
//! # Components
//!
//! - [`bridge`]: Accept loop and shutdown
//! - [`session`]: One device session from handshake to address release
//! - [`switch`]: Routing between sessions and system services
//! - [`system`]: Services hosted at `System` addresses
//! - [`http`]: Web servers hosted at `System` addresses
//! - [`client`]: Front-end side of the wire protocol
//! - [`transport`]: TCP transport
//! - [`config`]: Bridge configuration
//! - [`mod@env`]: Production environment
//! - [`error`]: Error types

#![forbid(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod http;
pub mod session;
pub mod switch;
pub mod system;
pub mod transport;

pub use bridge::{ServerBridge, ShutdownHandle};
pub use client::DeviceClient;
pub use config::BridgeConfig;
pub use env::SystemEnv;
pub use error::BridgeError;
pub use http::{HttpServer, SystemServerRegistry, TestSystemServer};
pub use session::{DeviceSession, SessionSummary};
pub use switch::{SessionPorts, Switch, SwitchStats};
pub use system::{EchoService, SystemService, TimeService};
pub use transport::TcpTransport;
