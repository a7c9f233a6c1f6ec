//! SQLite implementation of the storage traits.
//!
//! This is the primary backend for both replicas and relays. It uses
//! rusqlite with bundled SQLite behind a mutex; every call runs on the
//! blocking pool via `tokio::task::spawn_blocking`, so the connection acts
//! as a dedicated worker and all SQL is serialized there.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use driftsync_core::{Message, OwnerId, Timestamp, TimestampRange, Value};
use driftsync_crypto::{WriteKey, WRITE_KEY_LEN};

use crate::error::{Result, StorageError};
use crate::fingerprint::Fingerprint;
use crate::migration;
use crate::traits::{HistoryEntry, HistoryStorage, Storage};

/// SQLite-backed storage.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open a database at the given path, creating and migrating it as
    /// needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database. Useful for tests.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create partial indexes over history registers for application
    /// query patterns. One index per `(table, column)` pair.
    pub async fn create_index(&self, table: &str, columns: &[String]) -> Result<()> {
        let table = table.to_string();
        let columns = columns.to_vec();
        self.blocking(move |conn| {
            for column in &columns {
                // Identifiers cannot be bound as parameters; they come
                // from local configuration, not the wire.
                conn.execute_batch(&format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_app_{table}_{column}\"
                     ON history(value, timestamp)
                     WHERE tbl = '{table}' AND col = '{column}'"
                ))?;
            }
            Ok(())
        })
        .await
    }

    /// Run a closure against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StorageError::WorkerGone(format!("connection mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::WorkerGone(format!("storage task failed: {e}")))?
    }
}

fn decode_timestamp(bytes: Vec<u8>) -> Result<Timestamp> {
    Timestamp::decode(&bytes)
        .map_err(|e| StorageError::InvalidData(format!("stored timestamp: {e}")))
}

fn decode_value(bytes: Vec<u8>) -> Result<Value> {
    Value::from_bytes(&bytes).map_err(|e| StorageError::InvalidData(format!("stored value: {e}")))
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn validate_write_key(&self, owner: OwnerId, write_key: &WriteKey) -> Result<bool> {
        let presented = *write_key;
        self.blocking(move |conn| {
            let stored: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT write_key FROM write_key WHERE owner_id = ?1",
                    params![owner.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;

            match stored {
                Some(bytes) => {
                    let arr: [u8; WRITE_KEY_LEN] = bytes.try_into().map_err(|_| {
                        StorageError::InvalidData("stored write key has wrong length".into())
                    })?;
                    // WriteKey equality is constant-time.
                    Ok(WriteKey::from_bytes(arr) == presented)
                }
                None => {
                    conn.execute(
                        "INSERT INTO write_key (owner_id, write_key) VALUES (?1, ?2)",
                        params![owner.as_bytes().as_slice(), presented.as_bytes().as_slice()],
                    )?;
                    Ok(true)
                }
            }
        })
        .await
    }

    async fn rotate_write_key(
        &self,
        owner: OwnerId,
        current: &WriteKey,
        next: &WriteKey,
    ) -> Result<bool> {
        let current = *current;
        let next = *next;
        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            let stored: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT write_key FROM write_key WHERE owner_id = ?1",
                    params![owner.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(bytes) = stored else {
                return Ok(false);
            };
            let arr: [u8; WRITE_KEY_LEN] = bytes.try_into().map_err(|_| {
                StorageError::InvalidData("stored write key has wrong length".into())
            })?;
            if WriteKey::from_bytes(arr) != current {
                return Ok(false);
            }

            tx.execute(
                "UPDATE write_key SET write_key = ?2 WHERE owner_id = ?1",
                params![owner.as_bytes().as_slice(), next.as_bytes().as_slice()],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn write_messages(&self, owner: OwnerId, messages: &[Message]) -> Result<()> {
        let messages = messages.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            for message in &messages {
                let ts = message.timestamp.encode();
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO message (owner_id, timestamp, change)
                     VALUES (?1, ?2, ?3)",
                    params![
                        owner.as_bytes().as_slice(),
                        ts.as_slice(),
                        message.change.as_ref()
                    ],
                )?;
                if inserted > 0 {
                    // Any index failure aborts the whole batch.
                    tx.execute(
                        "INSERT INTO timestamp_idx (owner_id, timestamp) VALUES (?1, ?2)",
                        params![owner.as_bytes().as_slice(), ts.as_slice()],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn read_change(&self, owner: OwnerId, timestamp: Timestamp) -> Result<Option<Bytes>> {
        self.blocking(move |conn| {
            let change: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT change FROM message WHERE owner_id = ?1 AND timestamp = ?2",
                    params![owner.as_bytes().as_slice(), timestamp.encode().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(change.map(Bytes::from))
        })
        .await
    }

    async fn size(&self, owner: OwnerId, range: TimestampRange) -> Result<u64> {
        self.blocking(move |conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM timestamp_idx
                 WHERE owner_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
                params![
                    owner.as_bytes().as_slice(),
                    range.lo.encode().as_slice(),
                    range.hi.encode().as_slice()
                ],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn fingerprint(&self, owner: OwnerId, range: TimestampRange) -> Result<Fingerprint> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp FROM timestamp_idx
                 WHERE owner_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
            )?;
            let mut fp = Fingerprint::EMPTY;
            let rows = stmt.query_map(
                params![
                    owner.as_bytes().as_slice(),
                    range.lo.encode().as_slice(),
                    range.hi.encode().as_slice()
                ],
                |row| row.get::<_, Vec<u8>>(0),
            )?;
            for row in rows {
                fp ^= Fingerprint::of_timestamp(&decode_timestamp(row?)?);
            }
            Ok(fp)
        })
        .await
    }

    async fn iterate_timestamps(
        &self,
        owner: OwnerId,
        range: TimestampRange,
        limit: Option<usize>,
    ) -> Result<Vec<Timestamp>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp FROM timestamp_idx
                 WHERE owner_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
                 ORDER BY timestamp LIMIT ?4",
            )?;
            let limit: i64 = limit.map_or(-1, |l| l as i64);
            let rows = stmt.query_map(
                params![
                    owner.as_bytes().as_slice(),
                    range.lo.encode().as_slice(),
                    range.hi.encode().as_slice(),
                    limit
                ],
                |row| row.get::<_, Vec<u8>>(0),
            )?;
            rows.map(|row| decode_timestamp(row.map_err(StorageError::from)?))
                .collect()
        })
        .await
    }

    async fn timestamp_at_rank(
        &self,
        owner: OwnerId,
        range: TimestampRange,
        rank: u64,
    ) -> Result<Option<Timestamp>> {
        self.blocking(move |conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT timestamp FROM timestamp_idx
                     WHERE owner_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
                     ORDER BY timestamp LIMIT 1 OFFSET ?4",
                    params![
                        owner.as_bytes().as_slice(),
                        range.lo.encode().as_slice(),
                        range.hi.encode().as_slice(),
                        rank as i64
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            bytes.map(decode_timestamp).transpose()
        })
        .await
    }
}

#[async_trait]
impl HistoryStorage for SqliteStorage {
    async fn apply_history(&self, entries: &[HistoryEntry]) -> Result<()> {
        let entries = entries.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            for entry in &entries {
                tx.execute(
                    "INSERT OR IGNORE INTO history (tbl, row_id, col, value, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        entry.table,
                        entry.row,
                        entry.column,
                        entry.value.to_bytes(),
                        entry.timestamp.encode().as_slice()
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn current_value(&self, table: &str, row: &str, column: &str) -> Result<Option<Value>> {
        let (table, row, column) = (table.to_string(), row.to_string(), column.to_string());
        self.blocking(move |conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM history
                     WHERE tbl = ?1 AND row_id = ?2 AND col = ?3
                     ORDER BY timestamp DESC LIMIT 1",
                    params![table, row, column],
                    |r| r.get(0),
                )
                .optional()?;
            bytes.map(decode_value).transpose()
        })
        .await
    }

    async fn register_history(
        &self,
        table: &str,
        row: &str,
        column: &str,
    ) -> Result<Vec<(Timestamp, Value)>> {
        let (table, row, column) = (table.to_string(), row.to_string(), column.to_string());
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, value FROM history
                 WHERE tbl = ?1 AND row_id = ?2 AND col = ?3
                 ORDER BY timestamp DESC",
            )?;
            let rows = stmt.query_map(params![table, row, column], |r| {
                Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
            })?;
            rows.map(|row| {
                let (ts, value) = row.map_err(StorageError::from)?;
                Ok((decode_timestamp(ts)?, decode_value(value)?))
            })
            .collect()
        })
        .await
    }

    async fn is_row_deleted(&self, table: &str, row: &str) -> Result<bool> {
        let current = self
            .current_value(table, row, driftsync_core::IS_DELETED_COLUMN)
            .await?;
        Ok(current == Some(Value::Int(1)))
    }
}
