//! Order-insensitive range fingerprints.
//!
//! A fingerprint is the XOR of a 96-bit keyed hash of every timestamp in a
//! range. XOR makes the digest linear under disjoint union:
//! `fp(A ∪ B) = fp(A) ⊕ fp(B)` and `fp(range) = fp(left) ⊕ fp(right)`,
//! which is what lets the reconciler split ranges and recombine digests
//! without rescanning.

use std::fmt;

use serde::{Deserialize, Serialize};

use driftsync_core::Timestamp;

/// Size of a fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 12;

const FINGERPRINT_CONTEXT: &str = "driftsync v1 timestamp fingerprint";

/// A 12-byte order-insensitive digest of a timestamp set.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// The fingerprint of the empty set.
    pub const EMPTY: Self = Self([0u8; FINGERPRINT_LEN]);

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// The fingerprint of a single timestamp.
    pub fn of_timestamp(timestamp: &Timestamp) -> Self {
        let hash = blake3::derive_key(FINGERPRINT_CONTEXT, &timestamp.encode());
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&hash[..FINGERPRINT_LEN]);
        Self(out)
    }

    /// The fingerprint of a timestamp set.
    pub fn of_timestamps<'a>(timestamps: impl IntoIterator<Item = &'a Timestamp>) -> Self {
        let mut acc = Self::EMPTY;
        for ts in timestamps {
            acc ^= Self::of_timestamp(ts);
        }
        acc
    }
}

impl std::ops::BitXorAssign for Fingerprint {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

impl std::ops::BitXor for Fingerprint {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        self ^= rhs;
        self
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fp({})", hex::encode(self.0))
    }
}
