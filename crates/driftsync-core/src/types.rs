//! Strong identifier types shared across the engine.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of an owner identifier in bytes.
pub const OWNER_ID_LEN: usize = 21;

/// Length of a node identifier in bytes.
pub const NODE_ID_LEN: usize = 8;

/// A 21-byte owner identifier.
///
/// Identifies a replica group. Owner ids are public: relays index messages
/// by them. The corresponding secrets (encryption key, write key) never
/// leave the owning devices.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub [u8; OWNER_ID_LEN]);

impl OwnerId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; OWNER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; OWNER_ID_LEN] {
        &self.0
    }

    /// Generate a random owner id.
    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; OWNER_ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; OWNER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for OwnerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An 8-byte per-device node identifier.
///
/// A random value that makes timestamps produced by different devices
/// distinct even when physical time and counter collide.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Generate a random node id.
    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The all-zero node id (used in range bounds).
    pub const ZERO: Self = Self([0u8; NODE_ID_LEN]);

    /// The all-ones node id (used in range bounds).
    pub const MAX: Self = Self([0xff; NODE_ID_LEN]);
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Wall-clock capability.
///
/// Threaded through constructors instead of reading ambient time so that
/// tests can drive the clock deterministically.
pub trait Clock: Send + Sync {
    /// Current wall time in Unix milliseconds.
    fn now_millis(&self) -> u64;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock(std::sync::atomic::AtomicU64);

impl ManualClock {
    /// Create a clock starting at the given millisecond.
    pub fn new(millis: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(millis))
    }

    /// Set the current time.
    pub fn set(&self, millis: u64) {
        self.0.store(millis, std::sync::atomic::Ordering::SeqCst);
    }

    /// Advance the current time.
    pub fn advance(&self, delta_millis: u64) {
        self.0
            .fetch_add(delta_millis, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_owner_id_hex_roundtrip() {
        let id = OwnerId::from_bytes([0x42; OWNER_ID_LEN]);
        let hex = id.to_hex();
        let recovered = OwnerId::from_hex(&hex).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_owner_id_from_hex_rejects_bad_length() {
        assert!(OwnerId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_random_ids_differ() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = OwnerId::random(&mut rng);
        let b = OwnerId::random(&mut rng);
        assert_ne!(a, b);

        let n1 = NodeId::random(&mut rng);
        let n2 = NodeId::random(&mut rng);
        assert_ne!(n1, n2);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now_millis(), 1000);
        clock.advance(500);
        assert_eq!(clock.now_millis(), 1500);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
