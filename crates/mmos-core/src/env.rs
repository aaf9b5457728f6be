//! Environment abstraction for deterministic testing.
//!
//! The Environment trait abstracts all side effects (time, randomness) so
//! that session and bridge logic can run in production with real system
//! calls and in simulation with deterministic, controllable behavior.

use std::{future::Future, time::Duration};

/// Abstract environment providing time and randomness.
///
/// Implementations:
/// - Production: `tokio::time` clock and OS randomness
/// - Simulation: turmoil-controlled clock and seeded RNG
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current monotonic time.
    fn now(&self) -> std::time::Instant;

    /// Sleep for `duration`.
    ///
    /// In simulation this advances virtual time instead of blocking.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    ///
    /// Session identifiers are drawn from here, so simulation must seed it
    /// deterministically.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`, built from [`Environment::random_bytes`].
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
