//! # driftsync-crypto
//!
//! End-to-end encryption for driftsync: AEAD envelopes over serialized
//! changes, relay write keys, and mnemonic-based key derivation.
//!
//! The relay is untrusted. It stores `(owner_id, timestamp, ciphertext)`
//! and a write key per owner; it can reject unauthorized writers but can
//! never read a change.
//!
//! ## Key Types
//!
//! - [`EncryptionKey`] - 256-bit XChaCha20-Poly1305 key, one per owner
//! - [`WriteKey`] - 16-byte write-authorization secret, constant-time eq
//! - [`OwnerSecrets`] - the full identity derived from a BIP-39 mnemonic

pub mod envelope;
pub mod error;
pub mod keys;
pub mod mnemonic;

pub use envelope::{open_change, seal_change};
pub use error::{CryptoError, Result};
pub use keys::{
    EncryptionKey, EncryptionNonce, WriteKey, ENCRYPTION_KEY_LEN, NONCE_LEN, WRITE_KEY_LEN,
};
pub use mnemonic::{derive_owner, generate_mnemonic, parse_mnemonic, OwnerSecrets};

pub use bip39::Mnemonic;
