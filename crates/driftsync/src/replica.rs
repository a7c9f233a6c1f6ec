//! The replica: local mutations, remote applies, and LWW reads.
//!
//! A replica ties one owner's identity to one store and one hybrid
//! logical clock. A single async mutex guards the clock, the upload
//! queue, and the RNG, so local writes and remote applies interleave as a
//! linear history; this mutex is the per-owner serialization point of
//! the concurrency contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use tokio::sync::Mutex;

use driftsync_core::{Change, Clock, Hlc, Message, NodeId, OwnerId, Timestamp, Value};
use driftsync_crypto::{
    derive_owner, generate_mnemonic, open_change, parse_mnemonic, seal_change, Mnemonic,
    OwnerSecrets, WriteKey,
};
use driftsync_store::{HistoryEntry, HistoryStorage};
use driftsync_sync::{MessageSink, ReplicaHandle, SyncError};

use crate::config::Config;
use crate::error::Result;

/// One device's view of an owner's replicated data.
pub struct Replica<S: HistoryStorage> {
    secrets: OwnerSecrets,
    mnemonic: Mnemonic,
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    state: Mutex<ReplicaState>,
    decrypt_failures: AtomicU64,
}

struct ReplicaState {
    hlc: Hlc,
    queue: Vec<Message>,
    rng: StdRng,
}

impl<S: HistoryStorage> Replica<S> {
    /// Create a replica from configuration.
    ///
    /// Imports `config.mnemonic` when present, otherwise generates a
    /// fresh one; read it back via [`Replica::mnemonic`] so the user can
    /// save it.
    pub fn new(
        config: &Config,
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
        mut rng: StdRng,
    ) -> Result<Self> {
        let mnemonic = match &config.mnemonic {
            Some(phrase) => parse_mnemonic(phrase)?,
            None => generate_mnemonic(&mut rng)?,
        };
        let secrets = derive_owner(&mnemonic);
        let node_id = NodeId::random(&mut rng);
        Ok(Self {
            secrets,
            mnemonic,
            storage,
            clock,
            state: Mutex::new(ReplicaState {
                hlc: Hlc::with_max_drift(node_id, config.max_drift_ms),
                queue: Vec::new(),
                rng,
            }),
            decrypt_failures: AtomicU64::new(0),
        })
    }

    /// The public owner id.
    pub fn owner_id(&self) -> OwnerId {
        self.secrets.owner_id
    }

    /// The mnemonic backing this replica's identity.
    pub fn mnemonic(&self) -> &Mnemonic {
        &self.mnemonic
    }

    /// The underlying store.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// How many received messages failed authentication and were dropped.
    pub fn decrypt_failure_count(&self) -> u64 {
        self.decrypt_failures.load(Ordering::Relaxed)
    }

    /// Apply local row-column mutations.
    ///
    /// Each change gets its own timestamp, is sealed under the owner key,
    /// appended to the log and history atomically, and queued for upload.
    /// A clock error rejects the whole call before anything is persisted
    /// or enqueued.
    pub async fn mutate(&self, changes: &[Change]) -> Result<Vec<Timestamp>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let wall = self.clock.now_millis();
        let owner = self.secrets.owner_id;
        let mut state = self.state.lock().await;

        let mut stamped = Vec::with_capacity(changes.len());
        for change in changes {
            stamped.push((state.hlc.send(wall)?, change));
        }

        let mut messages = Vec::with_capacity(stamped.len());
        let mut entries = Vec::with_capacity(stamped.len());
        for (timestamp, change) in &stamped {
            let envelope = seal_change(
                &self.secrets.encryption_key,
                &owner,
                timestamp,
                &change.to_bytes(),
                &mut state.rng,
            )?;
            messages.push(Message::new(*timestamp, envelope));
            entries.push(HistoryEntry {
                table: change.table.clone(),
                row: change.row.clone(),
                column: change.column.clone(),
                value: change.value.clone(),
                timestamp: *timestamp,
            });
        }

        self.storage.write_messages(owner, &messages).await?;
        self.storage.apply_history(&entries).await?;
        state.queue.extend(messages);

        Ok(stamped.into_iter().map(|(ts, _)| ts).collect())
    }

    /// Mark a row as logically deleted. History is preserved.
    pub async fn delete_row(&self, table: &str, row: &str) -> Result<Timestamp> {
        let timestamps = self
            .mutate(std::slice::from_ref(&Change::delete_marker(table, row)))
            .await?;
        Ok(timestamps[0])
    }

    /// The current value of a register (last writer wins).
    pub async fn current_value(
        &self,
        table: &str,
        row: &str,
        column: &str,
    ) -> Result<Option<Value>> {
        Ok(self.storage.current_value(table, row, column).await?)
    }

    /// Full register history, newest first.
    pub async fn history(
        &self,
        table: &str,
        row: &str,
        column: &str,
    ) -> Result<Vec<(Timestamp, Value)>> {
        Ok(self.storage.register_history(table, row, column).await?)
    }

    /// Whether a row is logically deleted.
    pub async fn is_deleted(&self, table: &str, row: &str) -> Result<bool> {
        Ok(self.storage.is_row_deleted(table, row).await?)
    }
}

#[async_trait]
impl<S: HistoryStorage> MessageSink for Replica<S> {
    /// Apply messages received from a peer.
    ///
    /// The clock merges every incoming timestamp first; drift rejects
    /// the batch with nothing applied. Messages that fail authentication
    /// are dropped and counted; the rest land atomically in the log and
    /// the history.
    async fn apply(
        &self,
        owner: OwnerId,
        messages: Vec<Message>,
    ) -> std::result::Result<Vec<Timestamp>, SyncError> {
        if owner != self.secrets.owner_id {
            return Err(SyncError::Protocol(format!(
                "messages for unexpected owner {owner}"
            )));
        }

        let wall = self.clock.now_millis();
        let mut state = self.state.lock().await;
        for message in &messages {
            state.hlc.receive(message.timestamp, wall)?;
        }

        let mut accepted = Vec::with_capacity(messages.len());
        let mut entries = Vec::with_capacity(messages.len());
        let mut applied = Vec::with_capacity(messages.len());
        for message in messages {
            let decoded = open_change(
                &self.secrets.encryption_key,
                &owner,
                &message.timestamp,
                &message.change,
            )
            .map_err(SyncError::from)
            .and_then(|plain| Change::from_bytes(&plain).map_err(SyncError::from));
            match decoded {
                Ok(change) => {
                    entries.push(HistoryEntry {
                        table: change.table,
                        row: change.row,
                        column: change.column,
                        value: change.value,
                        timestamp: message.timestamp,
                    });
                    applied.push(message.timestamp);
                    accepted.push(message);
                }
                Err(error) => {
                    self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(timestamp = %message.timestamp, %error, "dropping undecryptable message");
                }
            }
        }

        self.storage.write_messages(owner, &accepted).await?;
        self.storage.apply_history(&entries).await?;
        Ok(applied)
    }
}

#[async_trait]
impl<S: HistoryStorage> ReplicaHandle for Replica<S> {
    fn owner_id(&self) -> OwnerId {
        self.secrets.owner_id
    }

    fn write_key(&self) -> WriteKey {
        self.secrets.write_key
    }

    async fn pending_uploads(&self) -> Vec<Message> {
        self.state.lock().await.queue.clone()
    }

    async fn clear_uploads(&self, through: &[Timestamp]) {
        self.state
            .lock()
            .await
            .queue
            .retain(|m| !through.contains(&m.timestamp));
    }
}
