//! Production environment.

use std::{
    collections::hash_map::RandomState,
    future::Future,
    hash::{BuildHasher, Hasher},
    time::{Duration, Instant},
};

use mmos_core::env::Environment;

/// Tokio clock and OS randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Production environment.
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        // Follows tokio's clock so that paused-time tests stay consistent.
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        if let Err(error) = getrandom::fill(buffer) {
            tracing::warn!(%error, "OS randomness unavailable, using hasher keys");
            let state = RandomState::new();
            for (i, chunk) in buffer.chunks_mut(8).enumerate() {
                let mut hasher = state.build_hasher();
                hasher.write_usize(i);
                let word = hasher.finish().to_be_bytes();
                chunk.copy_from_slice(&word[..chunk.len()]);
            }
        }
    }
}
