//! Embedded browser capability.
//!
//! The browser engine lives outside the kernel and may be missing entirely
//! (headless server, standalone without an engine). The kernel holds an
//! optional provider and apps ask for it at call time through their
//! context; a missing provider hides browser features, it never fails a
//! launch.

use std::fmt;

/// Host-provided browser engine.
pub trait BrowserProvider: Send + Sync {
    /// Whether the engine can open pages right now.
    fn is_available(&self) -> bool;

    /// Open `url`, returning a host-defined page handle.
    ///
    /// # Errors
    /// Returns the engine's error message.
    fn open(&self, url: &str) -> Result<u64, String>;

    /// Engine name, for logs.
    fn name(&self) -> &str {
        "browser"
    }
}

impl fmt::Debug for dyn BrowserProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserProvider").field("name", &self.name()).finish()
    }
}
