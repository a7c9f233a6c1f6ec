//! # driftsync-core
//!
//! Pure primitives for the driftsync engine: hybrid logical clock
//! timestamps, the row-change data model, and the binary wire codec.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over the replicated data structures.
//!
//! ## Key Types
//!
//! - [`Timestamp`] - 16-byte hybrid logical clock value, totally ordered
//! - [`Hlc`] - per-device clock producing and merging timestamps
//! - [`Change`] - one row-column mutation (the plaintext of a message)
//! - [`Message`] - `(timestamp, ciphertext)`, the unit of replication
//! - [`OwnerId`] - 21-byte replica-group identifier
//!
//! ## Core Invariants
//!
//! 1. **Total order**: timestamp order equals `memcmp` on encodings
//! 2. **Monotonicity**: a clock never produces a non-increasing timestamp
//! 3. **Causality**: `receive` advances the local clock past the remote
//! 4. **Frozen encodings**: timestamp and change byte formats never change

pub mod change;
pub mod codec;
pub mod error;
pub mod message;
pub mod timestamp;
pub mod types;

pub use change::{Change, Value, IS_DELETED_COLUMN};
pub use error::{CoreError, Result};
pub use message::Message;
pub use timestamp::{
    Hlc, Timestamp, TimestampRange, DEFAULT_MAX_DRIFT_MS, MAX_COUNTER, MAX_MILLIS, TIMESTAMP_LEN,
};
pub use types::{Clock, ManualClock, NodeId, OwnerId, SystemClock, NODE_ID_LEN, OWNER_ID_LEN};
