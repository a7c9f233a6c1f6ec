//! Initiator-side sync session state machine.
//!
//! A session drives reconciliation for one owner over one transport: send
//! an Initiator frame, process the NonInitiator response, repeat until a
//! whole frame settles to skips. The responder (relay or in-process peer)
//! is stateless; all session progression lives here.
//!
//! ```text
//!       ┌─────────┐ first response ┌─────────┐ all ranges skip ┌────────┐
//! Start │ Opening │───────────────▶│ Syncing │────────────────▶│ Closed │
//!       └────┬────┘                └────┬────┘                 └────────┘
//!            │ key/version rejected     │ protocol/transport failure
//!            ▼                          ▼
//!        ┌─────────┐               ┌─────────┐
//!        │ Errored │◀──────────────│ Errored │
//!        └─────────┘               └─────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;

use driftsync_core::{Message, OwnerId, Timestamp};
use driftsync_crypto::WriteKey;
use driftsync_store::Storage;

use crate::error::{Result, SyncError};
use crate::messages::{all_skip, ErrorCode, Frame};
use crate::reconcile::{ReconcileConfig, Reconciler};
use crate::transport::Transport;

/// Where a session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// First frame sent, response pending.
    Opening,
    /// Reconciliation rounds in flight.
    Syncing,
    /// Both sides settled; terminal.
    Closed,
    /// The session failed; terminal. The orchestrator may open a new one
    /// after backoff.
    Errored,
}

/// Configuration for a sync session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for each response frame.
    pub round_timeout: Duration,
    /// Hard cap on rounds; exceeded means the peer is not converging.
    pub max_rounds: usize,
    /// Reconciliation tunables.
    pub reconcile: ReconcileConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(30),
            max_rounds: 256,
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// Result of a completed session.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Response frames processed.
    pub rounds: usize,
    /// Messages received and applied.
    pub received_count: usize,
    /// Ciphertexts pushed to the peer.
    pub sent_count: usize,
    /// Timestamps newly applied locally, in arrival order.
    pub applied: Vec<Timestamp>,
}

/// Where received messages land.
///
/// A client replica decrypts, merges its clock, and records history; a
/// bare store just persists. Either way the application must be atomic.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Apply received messages, returning the timestamps that were new.
    async fn apply(&self, owner: OwnerId, messages: Vec<Message>) -> Result<Vec<Timestamp>>;
}

/// A sink that writes straight to storage (relay side, storage-to-storage
/// tests).
pub struct StorageSink<'a, S: Storage + ?Sized>(pub &'a S);

#[async_trait]
impl<S: Storage + ?Sized> MessageSink for StorageSink<'_, S> {
    async fn apply(&self, owner: OwnerId, messages: Vec<Message>) -> Result<Vec<Timestamp>> {
        self.0.write_messages(owner, &messages).await?;
        Ok(messages.into_iter().map(|m| m.timestamp).collect())
    }
}

/// One initiator-side reconciliation session.
pub struct SyncSession<'a, S, T, A>
where
    S: Storage + ?Sized,
    T: Transport + ?Sized,
    A: MessageSink + ?Sized,
{
    storage: &'a S,
    transport: &'a T,
    sink: &'a A,
    owner: OwnerId,
    write_key: WriteKey,
    config: SessionConfig,
    state: SessionState,
}

impl<'a, S, T, A> SyncSession<'a, S, T, A>
where
    S: Storage + ?Sized,
    T: Transport + ?Sized,
    A: MessageSink + ?Sized,
{
    /// Create a session.
    pub fn new(
        storage: &'a S,
        transport: &'a T,
        sink: &'a A,
        owner: OwnerId,
        write_key: WriteKey,
        config: SessionConfig,
    ) -> Self {
        Self {
            storage,
            transport,
            sink,
            owner,
            write_key,
            config,
            state: SessionState::Opening,
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion.
    ///
    /// `queued` are locally produced messages not yet acknowledged by the
    /// peer; they ride the opening frame when they fit.
    pub async fn run(
        &mut self,
        queued: &[Message],
        rng: &mut (impl RngCore + Send),
    ) -> Result<SyncReport> {
        let result = self.drive(queued, rng).await;
        self.state = match result {
            Ok(_) => SessionState::Closed,
            Err(_) => SessionState::Errored,
        };
        result
    }

    async fn drive(
        &mut self,
        queued: &[Message],
        rng: &mut (impl RngCore + Send),
    ) -> Result<SyncReport> {
        let reconciler = Reconciler::new(self.storage, self.owner, self.config.reconcile.clone());
        let mut report = SyncReport::default();

        let opening = reconciler.initial_ranges(queued).await?;
        self.send_ranges(opening, rng).await?;

        loop {
            if report.rounds >= self.config.max_rounds {
                return Err(SyncError::Protocol(format!(
                    "no convergence after {} rounds",
                    report.rounds
                )));
            }

            let bytes = match self.transport.recv_timeout(self.config.round_timeout).await? {
                Some(bytes) => bytes,
                None => return Err(SyncError::TransportClosed),
            };
            report.rounds += 1;

            let ranges = match Frame::decode_padded(&bytes)? {
                Frame::Error { code, detail } => return Err(peer_error(code, detail)),
                Frame::Initiator { .. } => {
                    return Err(SyncError::Protocol(
                        "peer sent an initiator frame mid-session".into(),
                    ))
                }
                Frame::NonInitiator { owner, ranges } => {
                    if owner != self.owner {
                        return Err(SyncError::Protocol(format!(
                            "response for unexpected owner {owner}"
                        )));
                    }
                    ranges
                }
            };
            self.state = SessionState::Syncing;

            let step = reconciler.respond(&ranges).await?;
            report.sent_count += step.sent_changes;
            if !step.to_write.is_empty() {
                let applied = self.sink.apply(self.owner, step.to_write).await?;
                report.received_count += applied.len();
                report.applied.extend(applied);
            }

            if all_skip(&step.ranges) {
                tracing::debug!(owner = %self.owner, rounds = report.rounds, "sync session settled");
                return Ok(report);
            }
            self.send_ranges(step.ranges, rng).await?;
        }
    }

    async fn send_ranges(
        &self,
        ranges: Vec<crate::messages::RangeEntry>,
        rng: &mut (impl RngCore + Send),
    ) -> Result<()> {
        let frame = Frame::Initiator {
            owner: self.owner,
            write_key: self.write_key,
            ranges,
        };
        self.transport.send(frame.encode_padded(rng)?).await
    }
}

fn peer_error(code: ErrorCode, detail: String) -> SyncError {
    match code {
        ErrorCode::WriteKeyInvalid => SyncError::WriteKeyInvalid,
        ErrorCode::VersionUnsupported => SyncError::Peer(format!("version unsupported: {detail}")),
        ErrorCode::ClockDrift => SyncError::Peer(format!("peer rejected clock drift: {detail}")),
        ErrorCode::Protocol => SyncError::Protocol(format!("peer: {detail}")),
        ErrorCode::Storage => SyncError::Peer(format!("peer storage failure: {detail}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayHandler;
    use crate::transport::memory;
    use driftsync_core::{NodeId, TimestampRange};
    use driftsync_store::MemoryStorage;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, NodeId::from_bytes([2; 8])).unwrap()
    }

    fn msg(millis: u64) -> Message {
        Message::new(ts(millis), vec![millis as u8, 0xCC])
    }

    async fn run_session(
        client: &MemoryStorage,
        server: Arc<MemoryStorage>,
        owner: OwnerId,
        write_key: WriteKey,
        queued: &[Message],
    ) -> Result<SyncReport> {
        let (client_end, server_end) = memory::pair(64);
        let relay = RelayHandler::new(server, ReconcileConfig::default());
        let serve = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(99);
            relay.serve(&server_end, &mut rng).await
        });

        let sink = StorageSink(client);
        let mut session = SyncSession::new(
            client,
            &client_end,
            &sink,
            owner,
            write_key,
            SessionConfig::default(),
        );
        let mut rng = StdRng::seed_from_u64(7);
        let report = session.run(queued, &mut rng).await;
        drop(session);
        drop(client_end);
        serve.await.expect("serve task panicked").unwrap();
        report
    }

    #[tokio::test]
    async fn test_empty_sync_single_round() {
        let mut rng = StdRng::seed_from_u64(1);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);
        let client = MemoryStorage::new();
        let server = Arc::new(MemoryStorage::new());

        let report = run_session(&client, Arc::clone(&server), owner, key, &[])
            .await
            .unwrap();

        assert_eq!(report.rounds, 1);
        assert_eq!(report.received_count, 0);
        assert_eq!(report.sent_count, 0);
        assert_eq!(client.size(owner, TimestampRange::FULL).await.unwrap(), 0);
        assert_eq!(server.size(owner, TimestampRange::FULL).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upload_via_queue() {
        let mut rng = StdRng::seed_from_u64(2);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);
        let client = MemoryStorage::new();
        let server = Arc::new(MemoryStorage::new());

        let queued = vec![msg(1), msg(2), msg(3)];
        client.write_messages(owner, &queued).await.unwrap();

        let report = run_session(&client, Arc::clone(&server), owner, key, &queued)
            .await
            .unwrap();

        assert_eq!(server.size(owner, TimestampRange::FULL).await.unwrap(), 3);
        assert_eq!(
            server.read_change(owner, ts(2)).await.unwrap().unwrap(),
            client.read_change(owner, ts(2)).await.unwrap().unwrap()
        );
        assert!(report.rounds <= 3);
    }

    #[tokio::test]
    async fn test_download_catch_up() {
        let mut rng = StdRng::seed_from_u64(3);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);
        let client = MemoryStorage::new();
        let server = Arc::new(MemoryStorage::new());

        server
            .write_messages(owner, &[msg(10), msg(20), msg(30)])
            .await
            .unwrap();

        let report = run_session(&client, Arc::clone(&server), owner, key, &[])
            .await
            .unwrap();

        assert_eq!(report.received_count, 3);
        assert_eq!(client.size(owner, TimestampRange::FULL).await.unwrap(), 3);
        assert_eq!(
            client.fingerprint(owner, TimestampRange::FULL).await.unwrap(),
            server.fingerprint(owner, TimestampRange::FULL).await.unwrap()
        );
        assert!(report.rounds <= 3);
    }

    #[tokio::test]
    async fn test_interleaved_sets_converge() {
        let mut rng = StdRng::seed_from_u64(4);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);
        let client = MemoryStorage::new();
        let server = Arc::new(MemoryStorage::new());

        client
            .write_messages(owner, &[msg(1), msg(3), msg(5)])
            .await
            .unwrap();
        server
            .write_messages(owner, &[msg(2), msg(4), msg(6)])
            .await
            .unwrap();

        run_session(&client, Arc::clone(&server), owner, key, &[])
            .await
            .unwrap();

        assert_eq!(client.size(owner, TimestampRange::FULL).await.unwrap(), 6);
        assert_eq!(server.size(owner, TimestampRange::FULL).await.unwrap(), 6);
        assert_eq!(
            client.fingerprint(owner, TimestampRange::FULL).await.unwrap(),
            server.fingerprint(owner, TimestampRange::FULL).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_wrong_write_key_errors_without_writes() {
        let mut rng = StdRng::seed_from_u64(5);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);
        let wrong = WriteKey::generate(&mut rng);
        let client = MemoryStorage::new();
        let server = Arc::new(MemoryStorage::new());

        // The relay already knows this owner under `key`.
        assert!(server.validate_write_key(owner, &key).await.unwrap());
        let before = server.fingerprint(owner, TimestampRange::FULL).await.unwrap();

        let queued = vec![msg(1)];
        client.write_messages(owner, &queued).await.unwrap();
        let result = run_session(&client, Arc::clone(&server), owner, wrong, &queued).await;

        assert!(matches!(result, Err(SyncError::WriteKeyInvalid)));
        assert_eq!(
            server.fingerprint(owner, TimestampRange::FULL).await.unwrap(),
            before
        );
        assert_eq!(server.size(owner, TimestampRange::FULL).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_large_divergence_converges_in_logarithmic_rounds() {
        let mut rng = StdRng::seed_from_u64(6);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);
        let client = MemoryStorage::new();
        let server = Arc::new(MemoryStorage::new());

        let client_msgs: Vec<Message> = (1..=300).filter(|m| m % 2 == 1).map(msg).collect();
        let server_msgs: Vec<Message> = (1..=300).filter(|m| m % 2 == 0).map(msg).collect();
        client.write_messages(owner, &client_msgs).await.unwrap();
        server.write_messages(owner, &server_msgs).await.unwrap();

        let report = run_session(&client, Arc::clone(&server), owner, key, &[])
            .await
            .unwrap();

        assert_eq!(client.size(owner, TimestampRange::FULL).await.unwrap(), 300);
        assert_eq!(server.size(owner, TimestampRange::FULL).await.unwrap(), 300);
        // Median splits bound the depth around log2 of the set size.
        assert!(report.rounds <= 16, "took {} rounds", report.rounds);
    }
}
