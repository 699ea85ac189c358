//! Authenticated encryption using `XChaCha20-Poly1305`
//!
//! Ciphertext layout: `nonce (24 bytes) || ciphertext || tag (16 bytes)`.
//! The nonce is drawn from the caller's [`Prng`]; the 192-bit nonce space
//! makes random nonces safe even across many messages under one key.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};

use crate::{
    error::CryptoError,
    prng::Prng,
    ratchet::{KEY_SIZE, SymmetricKey},
};

/// `XChaCha20` nonce size
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Authenticated-encryption service.
///
/// Keys are taken as byte slices so callers holding keys of unknown origin
/// get [`CryptoError::IncorrectKeySize`] instead of a panic.
pub trait AuthenticatedEncryption {
    /// Encrypt `plaintext` under `key`.
    fn encrypt<P: Prng + ?Sized>(
        &self,
        key: &[u8],
        plaintext: &[u8],
        prng: &mut P,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt and authenticate `ciphertext` under `key`.
    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Generate a fresh key from `prng`.
    fn generate_key<P: Prng + ?Sized>(&self, prng: &mut P) -> SymmetricKey;
}

/// `XChaCha20-Poly1305` implementation of [`AuthenticatedEncryption`].
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaCha20Poly1305Aead;

impl XChaCha20Poly1305Aead {
    fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::IncorrectKeySize { expected: KEY_SIZE, actual: key.len() });
        }
        XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::IncorrectKeySize { expected: KEY_SIZE, actual: key.len() })
    }
}

impl AuthenticatedEncryption for XChaCha20Poly1305Aead {
    fn encrypt<P: Prng + ?Sized>(
        &self,
        key: &[u8],
        plaintext: &[u8],
        prng: &mut P,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Self::cipher(key)?;

        let mut nonce = [0u8; NONCE_SIZE];
        prng.fill_bytes(&mut nonce);

        let Ok(sealed) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
            unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Self::cipher(key)?;

        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::IncorrectBlockSize {
                minimum: NONCE_SIZE + TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        cipher.decrypt(XNonce::from_slice(nonce), sealed).map_err(|_| {
            CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
        })
    }

    fn generate_key<P: Prng + ?Sized>(&self, prng: &mut P) -> SymmetricKey {
        SymmetricKey::from_bytes(prng.random_32())
    }
}
