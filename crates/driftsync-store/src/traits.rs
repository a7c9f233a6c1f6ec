//! Storage traits: the abstract interfaces over the message log.
//!
//! [`Storage`] is the contract the sync protocol consumes. It is what a
//! relay exposes: a write-key gate plus an append-only log of ciphertexts
//! indexed by owner and timestamp, with the range queries reconciliation
//! needs. [`HistoryStorage`] extends it with the client-side plaintext
//! register history that backs last-writer-wins reads; a relay never
//! implements it.

use async_trait::async_trait;
use bytes::Bytes;

use driftsync_core::{Message, OwnerId, Timestamp, TimestampRange, Value};
use driftsync_crypto::WriteKey;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// Async interface over an owner-partitioned message log.
///
/// # Design Notes
///
/// - **Idempotent writes**: duplicate `(owner, timestamp)` rows are
///   silently skipped; re-applying a batch is a no-op.
/// - **Atomic batches**: `write_messages` persists all rows or none; a
///   single timestamp-index failure aborts the batch.
/// - **Lazy registration**: the first write key presented for an unknown
///   owner claims it; later keys must match in constant time.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Check a write key for an owner, registering an unknown owner on
    /// first use.
    async fn validate_write_key(&self, owner: OwnerId, write_key: &WriteKey) -> Result<bool>;

    /// Replace an owner's write key, authorized by the current one.
    ///
    /// Returns `false` (and changes nothing) when `current` does not match.
    async fn rotate_write_key(
        &self,
        owner: OwnerId,
        current: &WriteKey,
        next: &WriteKey,
    ) -> Result<bool>;

    /// Append messages atomically. Duplicates are skipped.
    async fn write_messages(&self, owner: OwnerId, messages: &[Message]) -> Result<()>;

    /// Read the ciphertext stored at a timestamp, if any.
    async fn read_change(&self, owner: OwnerId, timestamp: Timestamp) -> Result<Option<Bytes>>;

    /// Number of timestamps within the range.
    async fn size(&self, owner: OwnerId, range: TimestampRange) -> Result<u64>;

    /// Order-insensitive digest of all timestamps in the range.
    async fn fingerprint(&self, owner: OwnerId, range: TimestampRange) -> Result<Fingerprint>;

    /// Timestamps in the range in ascending order, optionally limited.
    async fn iterate_timestamps(
        &self,
        owner: OwnerId,
        range: TimestampRange,
        limit: Option<usize>,
    ) -> Result<Vec<Timestamp>>;

    /// The `rank`-th smallest timestamp in the range (0-based), or `None`
    /// when the range holds fewer elements. Enables median splits without
    /// full scans.
    async fn timestamp_at_rank(
        &self,
        owner: OwnerId,
        range: TimestampRange,
        rank: u64,
    ) -> Result<Option<Timestamp>>;
}

/// One row of the plaintext register history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Table name.
    pub table: String,
    /// Row identifier.
    pub row: String,
    /// Column name.
    pub column: String,
    /// The written value.
    pub value: Value,
    /// When the register was written.
    pub timestamp: Timestamp,
}

/// Client-side extension: decrypted register history and LWW reads.
#[async_trait]
pub trait HistoryStorage: Storage {
    /// Record decrypted changes in the history table.
    async fn apply_history(&self, entries: &[HistoryEntry]) -> Result<()>;

    /// The current value of a register: the value at its greatest
    /// timestamp, or `None` when the register was never written.
    async fn current_value(
        &self,
        table: &str,
        row: &str,
        column: &str,
    ) -> Result<Option<Value>>;

    /// Full history of a register, newest first.
    async fn register_history(
        &self,
        table: &str,
        row: &str,
        column: &str,
    ) -> Result<Vec<(Timestamp, Value)>>;

    /// Whether the row's `isDeleted` register is currently set.
    async fn is_row_deleted(&self, table: &str, row: &str) -> Result<bool>;
}
