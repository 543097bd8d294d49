//! Production environment: system clock, OS entropy, tokio sleep.

use std::time::Duration;

use mergeline_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// Session ids come from [`Environment::random_u64`], so they are drawn from
/// getrandom and not guessable by other clients.
///
/// # Panics
///
/// Panics if the OS RNG fails. A gateway that cannot draw session ids cannot
/// accept joins.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn system_env_time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();

        assert!(t2 > t1, "Time should advance");
    }

    #[test]
    fn system_env_session_ids_differ() {
        let env = SystemEnv::new();
        assert_ne!(env.random_u64(), env.random_u64());
    }

    #[tokio::test]
    async fn system_env_sleep_works() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(20)).await;

        assert!(env.now() - start >= Duration::from_millis(20));
    }
}
