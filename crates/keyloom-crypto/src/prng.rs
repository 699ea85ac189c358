//! Pseudo-random generators
//!
//! Everything in this crate that needs randomness takes a [`Prng`]. Production
//! callers back it with OS entropy; tests and handshakes use [`SeededPrng`].

use rand_chacha::{
    ChaCha20Rng,
    rand_core::{RngCore, SeedableRng},
};

/// Source of random bytes.
pub trait Prng {
    /// Fill `dest` with random bytes.
    fn fill_bytes(&mut self, dest: &mut [u8]);

    /// Generate 32 random bytes.
    fn random_32(&mut self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.fill_bytes(&mut bytes);
        bytes
    }
}

/// Deterministic ChaCha20 generator seeded from 32 bytes.
///
/// Same seed, same stream. Used for seeded key generation and for
/// reproducible tests.
pub struct SeededPrng {
    rng: ChaCha20Rng,
}

impl SeededPrng {
    /// Create a generator from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { rng: ChaCha20Rng::from_seed(seed) }
    }

    /// Create a generator from a `u64` seed (test convenience).
    pub fn from_u64(seed: u64) -> Self {
        Self { rng: ChaCha20Rng::seed_from_u64(seed) }
    }
}

impl Prng for SeededPrng {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}
