//! The replication unit: an encrypted change under an owner's log.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// A replicated message: a timestamp paired with an encrypted change.
///
/// The identity key within an owner's log is the timestamp alone; the
/// relay never sees past the ciphertext. Messages are append-only: created
/// on first local mutation or first receipt from a peer, never mutated,
/// never destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique, causally ordered identifier.
    pub timestamp: Timestamp,
    /// AEAD envelope over the canonical change bytes (nonce ‖ ciphertext).
    pub change: Bytes,
}

impl Message {
    /// Create a message.
    pub fn new(timestamp: Timestamp, change: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            change: change.into(),
        }
    }
}
