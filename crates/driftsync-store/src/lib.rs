//! # driftsync-store
//!
//! Persistence for the driftsync engine: an owner-partitioned, append-only
//! log of encrypted messages with the range queries set reconciliation
//! needs, plus the write-key table a relay enforces.
//!
//! ## Backends
//!
//! - [`SqliteStorage`] - primary backend (rusqlite, bundled SQLite)
//! - [`MemoryStorage`] - tests and in-process peers
//!
//! ## Key Invariants
//!
//! 1. **Append-only**: messages are never mutated or destroyed
//! 2. **Idempotent**: re-writing a `(owner, timestamp)` row is a no-op
//! 3. **Atomic**: a batch persists entirely or not at all
//! 4. **Linear fingerprints**: `fp(range) = fp(left) ⊕ fp(right)`

pub mod error;
pub mod fingerprint;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StorageError};
pub use fingerprint::{Fingerprint, FINGERPRINT_LEN};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::{HistoryEntry, HistoryStorage, Storage};
