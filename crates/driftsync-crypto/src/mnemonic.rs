//! Owner secrets derived from a BIP-39 mnemonic.
//!
//! A single mnemonic deterministically yields the owner's whole identity:
//! the public owner id, the encryption key, and the write key. Derivation
//! goes through blake3 `derive_key` with a distinct context string per
//! output, so no derived value reveals anything about the others.

use bip39::{Language, Mnemonic};
use rand::{CryptoRng, RngCore};

use driftsync_core::{OwnerId, OWNER_ID_LEN};

use crate::error::{CryptoError, Result};
use crate::keys::{EncryptionKey, WriteKey, WRITE_KEY_LEN};

const OWNER_ID_CONTEXT: &str = "driftsync v1 owner id";
const ENCRYPTION_KEY_CONTEXT: &str = "driftsync v1 encryption key";
const WRITE_KEY_CONTEXT: &str = "driftsync v1 write key";

/// The full secret identity of an owner.
pub struct OwnerSecrets {
    /// Public replica-group identifier.
    pub owner_id: OwnerId,
    /// Symmetric key sealing every change.
    pub encryption_key: EncryptionKey,
    /// Relay write-authorization secret.
    pub write_key: WriteKey,
}

impl std::fmt::Debug for OwnerSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerSecrets")
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh 12-word mnemonic.
pub fn generate_mnemonic(rng: &mut (impl RngCore + CryptoRng)) -> Result<Mnemonic> {
    Mnemonic::generate_in_with(rng, Language::English, 12)
        .map_err(|e| CryptoError::Mnemonic(e.to_string()))
}

/// Parse a mnemonic phrase.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic> {
    Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| CryptoError::Mnemonic(e.to_string()))
}

/// Derive the owner's identity from a mnemonic.
pub fn derive_owner(mnemonic: &Mnemonic) -> OwnerSecrets {
    let seed = mnemonic.to_seed("");

    let owner_hash = blake3::derive_key(OWNER_ID_CONTEXT, &seed);
    let mut owner_id = [0u8; OWNER_ID_LEN];
    owner_id.copy_from_slice(&owner_hash[..OWNER_ID_LEN]);

    let encryption_key = EncryptionKey::from_bytes(blake3::derive_key(ENCRYPTION_KEY_CONTEXT, &seed));

    let write_hash = blake3::derive_key(WRITE_KEY_CONTEXT, &seed);
    let mut write_key = [0u8; WRITE_KEY_LEN];
    write_key.copy_from_slice(&write_hash[..WRITE_KEY_LEN]);

    OwnerSecrets {
        owner_id: OwnerId::from_bytes(owner_id),
        encryption_key,
        write_key: WriteKey::from_bytes(write_key),
    }
}
