//! Simulation environment: virtual clock and seeded randomness.
//!
//! Two clusters built from the same seed draw the same session ids and see
//! the same clock readings, so a failing run can be replayed exactly.

#![allow(clippy::disallowed_types, reason = "Synchronous locking of RNG and clock state only")]

use std::{
    ops::Sub,
    sync::{Arc, Mutex},
    time::Duration,
};

use mergeline_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Point on the virtual clock, measured from the start of the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Time since the simulation started.
    pub fn elapsed_since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Deterministic environment for simulations.
///
/// Clones share the clock and the RNG.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
    clock: Arc<Mutex<Duration>>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            clock: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move the virtual clock forward.
    #[allow(clippy::expect_used)]
    pub fn advance(&self, duration: Duration) {
        let mut clock = self.clock.lock().expect("Mutex poisoned");
        *clock = clock.saturating_add(duration);
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    #[allow(clippy::expect_used)]
    fn now(&self) -> SimInstant {
        SimInstant(*self.clock.lock().expect("Mutex poisoned"))
    }

    /// Advances the virtual clock at call time, then yields once to the
    /// runtime.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        tokio::task::yield_now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("Mutex poisoned").fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_ids() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);

        let ids_a: Vec<u64> = (0..5).map(|_| a.random_u64()).collect();
        let ids_b: Vec<u64> = (0..5).map(|_| b.random_u64()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn different_seeds_diverge() {
        assert_ne!(SimEnv::with_seed(1).random_u64(), SimEnv::with_seed(2).random_u64());
    }

    #[test]
    fn clones_share_the_rng() {
        let env = SimEnv::with_seed(7);
        let clone = env.clone();

        let first = env.random_u64();
        let second = clone.random_u64();
        assert_ne!(first, second);
        assert_ne!(SimEnv::with_seed(7).random_u64(), second);
    }

    #[test]
    fn clock_only_moves_when_advanced() {
        let env = SimEnv::new();
        let start = env.now();
        assert_eq!(env.now(), start);

        env.advance(Duration::from_millis(250));
        assert_eq!(env.now() - start, Duration::from_millis(250));
        assert_eq!(start - env.now(), Duration::ZERO);
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let env = SimEnv::new();
        let start = env.now();

        env.sleep(Duration::from_secs(30)).await;

        assert_eq!(env.now().elapsed_since_start(), Duration::from_secs(30));
        assert_eq!(env.now() - start, Duration::from_secs(30));
    }
}
