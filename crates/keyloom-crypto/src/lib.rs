//! Keyloom Cryptographic Primitives
//!
//! Cryptographic building blocks for Keyloom channels. Pure functions with
//! deterministic outputs wherever possible. Callers provide a [`Prng`] for
//! anything that needs randomness, which keeps tests reproducible.
//!
//! # Key Lifecycle
//!
//! A channel between two devices is bootstrapped (and later full-ratcheted)
//! with an X25519 agreement. The agreed secret is split into one seed per
//! direction. Each seed drives a self-ratchet that emits single-use keys:
//!
//! ```text
//! X25519 agreement (per epoch)
//!        │
//!        ▼
//! HKDF → send seed / receive seed (direction separated)
//!        │
//!        ▼
//! Self-ratchet step → (next seed, key id, key)
//!        │
//!        ▼
//! XChaCha20-Poly1305 → ciphertext tagged with key id
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - The self-ratchet step is one-way: the next seed reveals nothing about
//!   keys emitted before it
//! - Seeds and keys are zeroized when dropped
//! - A full ratchet starts a fresh seed lineage from a new agreement
//!
//! Authenticity:
//! - XChaCha20-Poly1305 rejects any tampered ciphertext
//! - Low-order X25519 points are rejected during agreement

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod agreement;
pub mod derivation;
pub mod error;
pub mod prng;
pub mod ratchet;
pub mod suite;

pub use aead::{AuthenticatedEncryption, NONCE_SIZE, TAG_SIZE, XChaCha20Poly1305Aead};
pub use agreement::{AgreementKeyPair, PUBLIC_KEY_SIZE, SharedSecret, open_sealed, seal};
pub use derivation::{
    EpochSeeds, combine_secrets, confirmation_tag, derive_epoch_seeds, transcript_hash,
};
pub use error::CryptoError;
pub use prng::{Prng, SeededPrng};
pub use ratchet::{KEY_SIZE, KeyId, RatchetSeed, RatchetStep, SymmetricKey, ratchet_step};
pub use suite::SuiteVersion;
