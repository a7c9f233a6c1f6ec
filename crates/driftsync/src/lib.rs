//! # driftsync
//!
//! A local-first synchronization engine: any number of devices keep a
//! shared set of row-level changes consistent through an untrusted relay,
//! under end-to-end encryption, without central coordination.
//!
//! ## How it fits together
//!
//! Local mutations produce `(timestamp, encrypted change)` messages:
//! a hybrid logical clock stamps each row-column write, the owner key
//! seals it, and the message lands in the append-only log, the plaintext
//! history, and the upload queue. The orchestrator drives reconciliation
//! sessions against a relay (or a peer): range fingerprints find the
//! symmetric difference, ciphertexts flow both ways, and every replica
//! converges on the union. Reads are last-writer-wins per register;
//! deletes are a register too, so history survives.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use driftsync::{Change, Config, Replica, SystemClock, Value};
//! use driftsync_store::MemoryStorage;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! # async fn demo() -> driftsync::Result<()> {
//! let replica = Replica::new(
//!     &Config::default(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(SystemClock),
//!     StdRng::from_entropy(),
//! )?;
//!
//! replica
//!     .mutate(&[Change::new("todo", "r1", "title", Value::Text("buy milk".into()))])
//!     .await?;
//! assert_eq!(
//!     replica.current_value("todo", "r1", "title").await?,
//!     Some(Value::Text("buy milk".into()))
//! );
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod replica;

pub use config::{Config, IndexDef};
pub use error::{Error, Result};
pub use replica::Replica;

pub use driftsync_core::{
    Change, Clock, Hlc, ManualClock, Message, NodeId, OwnerId, SystemClock, Timestamp,
    TimestampRange, Value, IS_DELETED_COLUMN,
};
pub use driftsync_crypto::{Mnemonic, OwnerSecrets, WriteKey};
pub use driftsync_store::{
    Fingerprint, HistoryEntry, HistoryStorage, MemoryStorage, SqliteStorage, Storage,
};
pub use driftsync_sync::{
    BroadcastSubscribers, Connector, OrchestratorConfig, QuerySubscribers, RelayHandler,
    SessionConfig, SyncHandle, SyncPhase, SyncSession, SyncStatus, Transport,
};

use std::sync::Arc;

/// Open (and migrate) the SQLite database named by the configuration,
/// creating its application indexes.
pub async fn open_database(config: &Config) -> Result<Arc<SqliteStorage>> {
    let storage = Arc::new(SqliteStorage::open(config.database_file())?);
    for index in &config.indexes {
        storage.create_index(&index.table, &index.columns).await?;
    }
    Ok(storage)
}
