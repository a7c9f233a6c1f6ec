//! AEAD envelope over serialized changes.
//!
//! Each change is sealed under the owner's key before it ever leaves the
//! device. The associated data binds the ciphertext to its identity
//! `(owner_id, timestamp)`, so a relay cannot transplant a ciphertext onto
//! a different log position without failing authentication.

use bytes::Bytes;
use rand::RngCore;

use driftsync_core::{OwnerId, Timestamp, OWNER_ID_LEN, TIMESTAMP_LEN};

use crate::error::{CryptoError, Result};
use crate::keys::{EncryptionKey, EncryptionNonce, NONCE_LEN};

/// Associated data for a message: `owner_id ‖ timestamp`.
fn associated_data(owner_id: &OwnerId, timestamp: &Timestamp) -> [u8; OWNER_ID_LEN + TIMESTAMP_LEN] {
    let mut aad = [0u8; OWNER_ID_LEN + TIMESTAMP_LEN];
    aad[..OWNER_ID_LEN].copy_from_slice(owner_id.as_bytes());
    aad[OWNER_ID_LEN..].copy_from_slice(&timestamp.encode());
    aad
}

/// Seal canonical change bytes into an envelope: `nonce ‖ ciphertext`.
pub fn seal_change(
    key: &EncryptionKey,
    owner_id: &OwnerId,
    timestamp: &Timestamp,
    change_bytes: &[u8],
    rng: &mut impl RngCore,
) -> Result<Bytes> {
    let nonce = EncryptionNonce::generate(rng);
    let aad = associated_data(owner_id, timestamp);
    let ciphertext = key.seal(change_bytes, &aad, &nonce)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(Bytes::from(out))
}

/// Open an envelope back into canonical change bytes.
pub fn open_change(
    key: &EncryptionKey,
    owner_id: &OwnerId,
    timestamp: &Timestamp,
    envelope: &[u8],
) -> Result<Vec<u8>> {
    if envelope.len() < NONCE_LEN {
        return Err(CryptoError::MalformedEnvelope(format!(
            "{} bytes, shorter than the nonce",
            envelope.len()
        )));
    }
    let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    let aad = associated_data(owner_id, timestamp);
    key.open(ciphertext, &aad, &EncryptionNonce::from_bytes(nonce))
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::NodeId;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fixture() -> (EncryptionKey, OwnerId, Timestamp, StdRng) {
        let mut rng = StdRng::seed_from_u64(42);
        let key = EncryptionKey::generate(&mut rng);
        let owner = OwnerId::random(&mut rng);
        let ts = Timestamp::new(1_700_000_000_000, 0, NodeId::random(&mut rng)).unwrap();
        (key, owner, ts, rng)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (key, owner, ts, mut rng) = fixture();
        let envelope = seal_change(&key, &owner, &ts, b"change bytes", &mut rng).unwrap();
        let plain = open_change(&key, &owner, &ts, &envelope).unwrap();
        assert_eq!(plain, b"change bytes");
    }

    #[test]
    fn test_open_rejects_transplanted_timestamp() {
        let (key, owner, ts, mut rng) = fixture();
        let envelope = seal_change(&key, &owner, &ts, b"change bytes", &mut rng).unwrap();

        let other_ts = Timestamp::new(ts.millis() + 1, 0, ts.node_id()).unwrap();
        assert!(matches!(
            open_change(&key, &owner, &other_ts, &envelope),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_open_rejects_transplanted_owner() {
        let (key, owner, ts, mut rng) = fixture();
        let envelope = seal_change(&key, &owner, &ts, b"change bytes", &mut rng).unwrap();

        let other_owner = OwnerId::random(&mut rng);
        assert!(open_change(&key, &other_owner, &ts, &envelope).is_err());
    }

    #[test]
    fn test_open_rejects_short_envelope() {
        let (key, owner, ts, _) = fixture();
        assert!(matches!(
            open_change(&key, &owner, &ts, &[0u8; 5]),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_envelopes_for_same_plaintext_differ() {
        let (key, owner, ts, mut rng) = fixture();
        let a = seal_change(&key, &owner, &ts, b"same", &mut rng).unwrap();
        let b = seal_change(&key, &owner, &ts, b"same", &mut rng).unwrap();
        assert_ne!(a, b);
    }
}
