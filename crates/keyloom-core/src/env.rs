//! Environment abstraction for deterministic testing.
//!
//! Decouples the engine from system resources (time, randomness). Production
//! uses OS entropy and the system clock; tests use [`SimEnv`] with a seeded
//! generator and a clock they advance by hand.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG and clock state")]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use keyloom_crypto::{Prng, SeededPrng};

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only used by runtime code (maintenance loops), never by the engine.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Wall clock in Unix seconds. Used for key expiry.
    fn wall_clock_secs(&self) -> u64;

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates 32 random bytes, the size of every identifier.
    fn random_32(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// [`Prng`] view over an [`Environment`].
///
/// Lets crypto routines that take a `Prng` draw from the environment's
/// entropy.
pub struct EntropyPrng<'a, E: Environment> {
    env: &'a E,
}

impl<'a, E: Environment> EntropyPrng<'a, E> {
    /// Borrow `env` as a generator.
    pub fn new(env: &'a E) -> Self {
        Self { env }
    }
}

impl<E: Environment> Prng for EntropyPrng<'_, E> {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.env.random_bytes(dest);
    }
}

/// Deterministic environment for tests and simulations.
///
/// Randomness comes from a seeded ChaCha20 stream; the wall clock only moves
/// when [`SimEnv::advance`] is called or a sleep completes. Clones share the
/// same generator and clock.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<Mutex<SimState>>,
}

struct SimState {
    prng: SeededPrng,
    elapsed: Duration,
    epoch_secs: u64,
}

impl SimEnv {
    /// Wall clock value a fresh `SimEnv` starts at (2024-01-01T00:00:00Z).
    pub const START_SECS: u64 = 1_704_067_200;

    /// Create an environment whose randomness is derived from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                prng: SeededPrng::from_u64(seed),
                elapsed: Duration::ZERO,
                epoch_secs: Self::START_SECS,
            })),
        }
    }

    /// Move both clocks forward.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn advance(&self, duration: Duration) {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        state.elapsed += duration;
        state.epoch_secs += duration.as_secs();
    }
}

impl Environment for SimEnv {
    type Instant = Duration;

    #[allow(clippy::expect_used)]
    fn now(&self) -> Duration {
        self.inner.lock().expect("Mutex poisoned").elapsed
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.lock().expect("Mutex poisoned").prng.fill_bytes(buffer);
    }

    #[allow(clippy::expect_used)]
    fn wall_clock_secs(&self) -> u64 {
        self.inner.lock().expect("Mutex poisoned").epoch_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_env_is_reproducible() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_32(), b.random_32());
        assert_eq!(a.random_u64(), b.random_u64());
    }

    #[test]
    fn clones_share_clock() {
        let env = SimEnv::with_seed(1);
        let clone = env.clone();

        env.advance(Duration::from_secs(90));

        assert_eq!(clone.now(), Duration::from_secs(90));
        assert_eq!(clone.wall_clock_secs(), SimEnv::START_SECS + 90);
    }

    #[test]
    fn entropy_prng_draws_from_env() {
        let env = SimEnv::with_seed(7);
        let expected = SimEnv::with_seed(7).random_32();

        let mut prng = EntropyPrng::new(&env);
        assert_eq!(prng.random_32(), expected);
    }
}
