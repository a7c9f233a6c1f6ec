//! In-memory implementation of the storage traits.
//!
//! Primarily for tests and peer-to-peer sync experiments. Same semantics
//! as the SQLite backend with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use driftsync_core::{Message, OwnerId, Timestamp, TimestampRange, Value, IS_DELETED_COLUMN};
use driftsync_crypto::WriteKey;

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::traits::{HistoryEntry, HistoryStorage, Storage};

type RegisterKey = (String, String, String);

/// In-memory storage. Thread-safe via RwLock; all data is lost on drop.
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Ciphertexts keyed by (owner, timestamp). BTreeMap keeps range
    /// scans in timestamp order.
    messages: HashMap<OwnerId, BTreeMap<Timestamp, Bytes>>,

    /// One write key per known owner.
    write_keys: HashMap<OwnerId, WriteKey>,

    /// Plaintext register history: (table, row, column) -> by timestamp.
    history: HashMap<RegisterKey, BTreeMap<Timestamp, Value>>,
}

impl MemoryStorage {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn validate_write_key(&self, owner: OwnerId, write_key: &WriteKey) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        match inner.write_keys.get(&owner) {
            Some(stored) => Ok(stored == write_key),
            None => {
                inner.write_keys.insert(owner, *write_key);
                Ok(true)
            }
        }
    }

    async fn rotate_write_key(
        &self,
        owner: OwnerId,
        current: &WriteKey,
        next: &WriteKey,
    ) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        match inner.write_keys.get(&owner) {
            Some(stored) if stored == current => {
                inner.write_keys.insert(owner, *next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn write_messages(&self, owner: OwnerId, messages: &[Message]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let log = inner.messages.entry(owner).or_default();
        for message in messages {
            log.entry(message.timestamp)
                .or_insert_with(|| message.change.clone());
        }
        Ok(())
    }

    async fn read_change(&self, owner: OwnerId, timestamp: Timestamp) -> Result<Option<Bytes>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .messages
            .get(&owner)
            .and_then(|log| log.get(&timestamp).cloned()))
    }

    async fn size(&self, owner: OwnerId, range: TimestampRange) -> Result<u64> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .messages
            .get(&owner)
            .map_or(0, |log| log.range(range.lo..range.hi).count() as u64))
    }

    async fn fingerprint(&self, owner: OwnerId, range: TimestampRange) -> Result<Fingerprint> {
        let inner = self.inner.read().unwrap();
        Ok(inner.messages.get(&owner).map_or(Fingerprint::EMPTY, |log| {
            Fingerprint::of_timestamps(log.range(range.lo..range.hi).map(|(ts, _)| ts))
        }))
    }

    async fn iterate_timestamps(
        &self,
        owner: OwnerId,
        range: TimestampRange,
        limit: Option<usize>,
    ) -> Result<Vec<Timestamp>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.messages.get(&owner).map_or_else(Vec::new, |log| {
            let iter = log.range(range.lo..range.hi).map(|(ts, _)| *ts);
            match limit {
                Some(n) => iter.take(n).collect(),
                None => iter.collect(),
            }
        }))
    }

    async fn timestamp_at_rank(
        &self,
        owner: OwnerId,
        range: TimestampRange,
        rank: u64,
    ) -> Result<Option<Timestamp>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.messages.get(&owner).and_then(|log| {
            log.range(range.lo..range.hi)
                .nth(rank as usize)
                .map(|(ts, _)| *ts)
        }))
    }
}

#[async_trait]
impl HistoryStorage for MemoryStorage {
    async fn apply_history(&self, entries: &[HistoryEntry]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for entry in entries {
            inner
                .history
                .entry((entry.table.clone(), entry.row.clone(), entry.column.clone()))
                .or_default()
                .entry(entry.timestamp)
                .or_insert_with(|| entry.value.clone());
        }
        Ok(())
    }

    async fn current_value(&self, table: &str, row: &str, column: &str) -> Result<Option<Value>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .history
            .get(&(table.to_string(), row.to_string(), column.to_string()))
            .and_then(|by_ts| by_ts.last_key_value().map(|(_, v)| v.clone())))
    }

    async fn register_history(
        &self,
        table: &str,
        row: &str,
        column: &str,
    ) -> Result<Vec<(Timestamp, Value)>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .history
            .get(&(table.to_string(), row.to_string(), column.to_string()))
            .map_or_else(Vec::new, |by_ts| {
                by_ts.iter().rev().map(|(ts, v)| (*ts, v.clone())).collect()
            }))
    }

    async fn is_row_deleted(&self, table: &str, row: &str) -> Result<bool> {
        let current = self.current_value(table, row, IS_DELETED_COLUMN).await?;
        Ok(current == Some(Value::Int(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::NodeId;

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, NodeId::from_bytes([3; 8])).unwrap()
    }

    #[tokio::test]
    async fn test_idempotent_writes_keep_first_change() {
        let store = MemoryStorage::new();
        let owner = OwnerId::from_bytes([1; 21]);

        store
            .write_messages(owner, &[Message::new(ts(1), vec![1u8])])
            .await
            .unwrap();
        store
            .write_messages(owner, &[Message::new(ts(1), vec![2u8])])
            .await
            .unwrap();

        let change = store.read_change(owner, ts(1)).await.unwrap().unwrap();
        assert_eq!(change.as_ref(), &[1u8]);
        assert_eq!(store.size(owner, TimestampRange::FULL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_range_queries_match_sqlite_semantics() {
        let store = MemoryStorage::new();
        let owner = OwnerId::from_bytes([2; 21]);
        for millis in [10, 20, 30] {
            store
                .write_messages(owner, &[Message::new(ts(millis), vec![0u8])])
                .await
                .unwrap();
        }

        let range = TimestampRange::new(ts(10), ts(30));
        assert_eq!(store.size(owner, range).await.unwrap(), 2);
        assert_eq!(
            store.iterate_timestamps(owner, range, None).await.unwrap(),
            vec![ts(10), ts(20)]
        );
        assert_eq!(
            store
                .timestamp_at_rank(owner, TimestampRange::FULL, 1)
                .await
                .unwrap(),
            Some(ts(20))
        );
    }

    #[tokio::test]
    async fn test_fingerprint_equals_sqlite_fingerprint() {
        let memory = MemoryStorage::new();
        let sqlite = crate::sqlite::SqliteStorage::open_memory().unwrap();
        let owner = OwnerId::from_bytes([3; 21]);
        let batch: Vec<Message> = [5u64, 17, 99]
            .iter()
            .map(|m| Message::new(ts(*m), vec![0u8]))
            .collect();

        memory.write_messages(owner, &batch).await.unwrap();
        sqlite.write_messages(owner, &batch).await.unwrap();

        assert_eq!(
            memory.fingerprint(owner, TimestampRange::FULL).await.unwrap(),
            sqlite.fingerprint(owner, TimestampRange::FULL).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_history_current_value() {
        let store = MemoryStorage::new();
        store
            .apply_history(&[
                HistoryEntry {
                    table: "t".into(),
                    row: "r".into(),
                    column: "c".into(),
                    value: Value::Int(1),
                    timestamp: ts(1),
                },
                HistoryEntry {
                    table: "t".into(),
                    row: "r".into(),
                    column: "c".into(),
                    value: Value::Int(2),
                    timestamp: ts(2),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            store.current_value("t", "r", "c").await.unwrap(),
            Some(Value::Int(2))
        );
        let history = store.register_history("t", "r", "c").await.unwrap();
        assert_eq!(history[0], (ts(2), Value::Int(2)));
    }
}
