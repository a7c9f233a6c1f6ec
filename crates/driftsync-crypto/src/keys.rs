//! Symmetric key material: owner encryption keys and write keys.
//!
//! Confidentiality comes from XChaCha20-Poly1305 under the owner's
//! 256-bit key; the 24-byte nonces are large enough to draw randomly
//! without coordination between devices. Authorization at the relay is a
//! 16-byte write key compared in constant time.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, Result};

/// Length of an owner encryption key in bytes.
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Length of an AEAD nonce in bytes.
pub const NONCE_LEN: usize = 24;

/// Length of a write key in bytes.
pub const WRITE_KEY_LEN: usize = 16;

/// A 256-bit symmetric encryption key for XChaCha20-Poly1305.
#[derive(Clone)]
pub struct EncryptionKey([u8; ENCRYPTION_KEY_LEN]);

impl EncryptionKey {
    /// Generate a new random key.
    pub fn generate(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; ENCRYPTION_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; ENCRYPTION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; ENCRYPTION_KEY_LEN] {
        &self.0
    }

    /// Encrypt with this key, binding the associated data.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        cipher
            .encrypt(
                XNonce::from_slice(&nonce.0),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::Encrypt(e.to_string()))
    }

    /// Decrypt with this key, verifying the associated data.
    pub fn open(&self, ciphertext: &[u8], aad: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        cipher
            .decrypt(
                XNonce::from_slice(&nonce.0),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "EncryptionKey(..)")
    }
}

/// A 192-bit random nonce for XChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionNonce(pub [u8; NONCE_LEN]);

impl EncryptionNonce {
    /// Generate a new random nonce.
    pub fn generate(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// A 16-byte shared secret authorizing writes for an owner at a relay.
///
/// Equality is constant-time: a relay comparing presented keys must not
/// leak prefix-match length through timing.
#[derive(Clone, Copy)]
pub struct WriteKey([u8; WRITE_KEY_LEN]);

impl WriteKey {
    /// Generate a new random write key.
    pub fn generate(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; WRITE_KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; WRITE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; WRITE_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for WriteKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for WriteKey {}

impl std::fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "WriteKey(..)")
    }
}
