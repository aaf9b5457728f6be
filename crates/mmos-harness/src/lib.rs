//! Deterministic simulation harness for MMOS.
//!
//! Two layers:
//!
//! - [`SimEnv`] and [`SimTransport`] plug turmoil's clock, network and a
//!   seeded RNG into the server bridge, so whole bridge sessions run in a
//!   reproducible simulated network.
//! - [`scenario`] wires several device kernels to one in-process switch and
//!   pumps them by hand, one tick at a time, for tests that care about
//!   routing and lifecycle rather than sockets.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod scenario;
pub mod sim_env;
pub mod sim_transport;

pub use sim_env::SimEnv;
pub use sim_transport::SimTransport;
