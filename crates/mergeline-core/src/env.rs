//! Environment abstraction for deterministic testing.
//!
//! Decouples relay logic from system resources (time, randomness). The
//! server runs on the system clock and OS entropy; the simulation harness
//! substitutes a manual clock and a seeded RNG so runs are reproducible.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` is seeded deterministically in simulation and uses OS
///   entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`; simulation uses a virtual
    /// instant advanced by the test driver.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleep for the given duration.
    ///
    /// Only driver code sleeps; ordering logic never waits on time.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`, used for session and request identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
