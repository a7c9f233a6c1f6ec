//! Database schema migrations for SQLite.
//!
//! A simple versioned migration system: each migration transforms the
//! schema from version N to N+1 inside one transaction. Upgrades are
//! append-only: new tables and columns, never destructive alterations.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, StorageError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;
        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
        }
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![CURRENT_VERSION],
        )?;
        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StorageError::Migration(format!(
            "unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: initial schema.
///
/// Timestamps are stored as their frozen 16-byte encodings, so SQLite's
/// BLOB comparison orders them exactly as the hybrid logical clock does
/// and range scans need no decoding.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- The append-only message log: one ciphertext per timestamp.
        CREATE TABLE message (
            owner_id BLOB NOT NULL,        -- 21 bytes
            timestamp BLOB NOT NULL,       -- 16 bytes, big-endian HLC encoding
            change BLOB NOT NULL,          -- AEAD envelope (nonce || ciphertext)
            PRIMARY KEY (owner_id, timestamp)
        ) WITHOUT ROWID;

        -- Timestamp index powering range sizes, fingerprints, and rank
        -- queries without touching ciphertext pages.
        CREATE TABLE timestamp_idx (
            owner_id BLOB NOT NULL,
            timestamp BLOB NOT NULL,
            PRIMARY KEY (owner_id, timestamp)
        ) WITHOUT ROWID;

        -- One write key per owner known to this database.
        CREATE TABLE write_key (
            owner_id BLOB PRIMARY KEY,
            write_key BLOB NOT NULL        -- 16 bytes
        ) WITHOUT ROWID;

        -- Client-side plaintext register history (never populated on a
        -- relay). Current values are the greatest-timestamp rows.
        CREATE TABLE history (
            tbl TEXT NOT NULL,
            row_id TEXT NOT NULL,
            col TEXT NOT NULL,
            value BLOB NOT NULL,           -- canonical CBOR scalar
            timestamp BLOB NOT NULL,
            PRIMARY KEY (tbl, row_id, col, timestamp)
        ) WITHOUT ROWID;

        CREATE INDEX idx_history_register ON history(tbl, row_id, col, timestamp DESC);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["message", "timestamp_idx", "write_key", "history", "meta"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
