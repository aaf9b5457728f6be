//! MMOS kernel core
//!
//! Pure state machines for one simulated device, decoupled from real I/O.
//! Time is passed in by the caller, packets arrive and leave through bounded
//! queues, and every navigation transition reports what it did as a list of
//! events instead of calling back into the host.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────── Kernel ─────────────────────────────┐
//!  tick(elapsed) ─┤  ScreenLifecycleManager ── AppRegistry (instantiate)            │
//!                 │        │ AppContext                                             │
//!                 │        ▼                                                        │
//!                 │  VirtualNetworkStack ── SharedRegistry (is_allocated, flights)  │
//!                 └──────────┬─────────────────────────────────▲────────────────────┘
//!                            │ outbound relay (mpsc)           │ inbound relay (mpsc)
//!                            ▼                                 │
//!                        ServerBridge / simulation harness ────┘
//! ```
//!
//! # Components
//!
//! - [`address`]: Virtual address allocation and in-flight accounting
//! - [`network`]: Endpoint registry, loopback delivery and relay forwarding
//! - [`app`]: App capability trait, manifests and the install catalog
//! - [`context`]: The handle apps use to reach the network and navigation
//! - [`screen`]: Navigation stack state machine
//! - [`kernel`]: Composition root with boot/tick/shutdown
//! - [`layout`]: Persisted launcher layout and app state
//! - [`browser`]: Optional embedded-browser capability
//! - [`connection`]: Session link state machine (handshake, heartbeat, timeout)
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`transport`]: Transport abstraction and frame I/O
//! - [`error`]: Error types

pub mod address;
pub mod app;
pub mod browser;
pub mod connection;
pub mod context;
pub mod env;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod network;
pub mod screen;
pub mod transport;

pub use address::{AddressRegistry, RegistryConfig, SharedRegistry};
pub use app::{App, AppFactory, AppManifest, AppRegistry, InstanceId};
pub use browser::BrowserProvider;
pub use context::{AppContext, NavRequest};
pub use error::{AddressError, AppError, KernelError, LifecycleError, NetworkError};
pub use kernel::{Kernel, KernelConfig, KernelState, TickReport};
pub use layout::PersistedLayout;
pub use network::{Endpoint, NetStats, NetworkConfig, NetworkStatus, RelayLink, VirtualNetworkStack};
pub use screen::{FrameState, LifecycleEvent, ManagerState, ScreenLifecycleManager};
