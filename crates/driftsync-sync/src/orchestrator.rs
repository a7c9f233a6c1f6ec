//! The sync orchestrator: one long-lived driver per owner.
//!
//! The orchestrator owns the retry loop around sessions: connect, run one
//! reconciliation session, fan newly applied timestamps out to query
//! subscribers, and back off with jitter on transient failures. A
//! per-owner worker task is the serialization point the concurrency
//! contract requires: at most one session per owner, with local writes
//! and remote applies meeting inside the replica's own lock.
//!
//! Disposal is cooperative: dropping or disposing the handle cancels the
//! in-flight session; anything not yet committed is simply never applied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::{watch, Notify, Semaphore};

use driftsync_core::{Clock, Message, OwnerId, Timestamp};
use driftsync_crypto::WriteKey;
use driftsync_store::Storage;

use crate::error::{Result, SyncError};
use crate::protocol::{MessageSink, SessionConfig, SyncSession};
use crate::transport::Transport;

/// Default bound on concurrent outbound sessions across owners.
pub const DEFAULT_MAX_SESSIONS: usize = 2;

/// Exponential backoff with jitter for transient failures.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First retry delay.
    pub initial: Duration,
    /// Multiplier per attempt.
    pub factor: f64,
    /// Delay ceiling.
    pub max: Duration,
    /// Jitter fraction applied to the computed delay (±).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// The delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = base.min(self.max.as_millis() as f64);
        let jitter = 1.0 + self.jitter * (rng.gen::<f64>() * 2.0 - 1.0);
        Duration::from_millis((capped * jitter) as u64)
    }
}

/// The coarse sync state surfaced to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No session requested yet.
    Idle,
    /// A session (or retry loop) is in flight.
    Syncing,
    /// The last session settled.
    Synced,
    /// The last session failed in a way worth surfacing.
    Error,
}

/// Observable sync status. The store never appears half-synced: `Synced`
/// is only published after an atomic apply completed.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Current phase.
    pub phase: SyncPhase,
    /// Message for the `Error` phase.
    pub error: Option<String>,
    /// Wall time of the last successful session, Unix milliseconds.
    pub last_synced_at: Option<u64>,
}

impl SyncStatus {
    fn idle() -> Self {
        Self {
            phase: SyncPhase::Idle,
            error: None,
            last_synced_at: None,
        }
    }
}

/// Opens transports to the sync endpoint; reconnection is a new call.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The transport this connector produces.
    type Transport: Transport + 'static;

    /// Open a fresh connection.
    async fn connect(&self) -> Result<Self::Transport>;
}

/// The client state a sync worker drives: identity, upload queue, and the
/// atomic apply path.
#[async_trait]
pub trait ReplicaHandle: MessageSink {
    /// The owner this replica holds.
    fn owner_id(&self) -> OwnerId;

    /// Write authorization presented to the relay.
    fn write_key(&self) -> WriteKey;

    /// Locally produced messages not yet acknowledged by a settled
    /// session.
    async fn pending_uploads(&self) -> Vec<Message>;

    /// Drop acknowledged messages from the upload queue.
    async fn clear_uploads(&self, through: &[Timestamp]);
}

/// Notified with each batch of newly applied timestamps, in HLC order per
/// owner, so higher layers can refresh derived views.
pub trait QuerySubscribers: Send + Sync {
    /// Called after an atomic apply commits.
    fn notify(&self, owner: OwnerId, timestamps: &[Timestamp]);
}

/// No-op subscribers.
pub struct NoSubscribers;

impl QuerySubscribers for NoSubscribers {
    fn notify(&self, _owner: OwnerId, _timestamps: &[Timestamp]) {}
}

/// Subscribers backed by a tokio broadcast channel.
pub struct BroadcastSubscribers {
    tx: tokio::sync::broadcast::Sender<(OwnerId, Vec<Timestamp>)>,
}

impl BroadcastSubscribers {
    /// Create with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to applied-timestamp batches.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<(OwnerId, Vec<Timestamp>)> {
        self.tx.subscribe()
    }
}

impl QuerySubscribers for BroadcastSubscribers {
    fn notify(&self, owner: OwnerId, timestamps: &[Timestamp]) {
        let _ = self.tx.send((owner, timestamps.to_vec()));
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Per-session settings.
    pub session: SessionConfig,
    /// Retry policy for transient failures.
    pub backoff: BackoffConfig,
}

/// Disposable handle to a per-owner sync worker.
pub struct SyncHandle {
    trigger: Arc<Notify>,
    cancel: watch::Sender<bool>,
    status: watch::Receiver<SyncStatus>,
    task: tokio::task::JoinHandle<()>,
}

impl SyncHandle {
    /// Ask the worker to run a session soon (coalesces with pending
    /// requests).
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// The current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Cancel the worker and wait for it to wind down. Anything not yet
    /// committed is never applied.
    pub async fn dispose(mut self) {
        let _ = self.cancel.send(true);
        self.trigger.notify_one();
        let _ = (&mut self.task).await;
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        self.trigger.notify_one();
    }
}

/// Spawn the sync worker for one owner.
#[allow(clippy::too_many_arguments)]
pub fn spawn_sync<S, R, C>(
    storage: Arc<S>,
    replica: Arc<R>,
    connector: C,
    subscribers: Arc<dyn QuerySubscribers>,
    clock: Arc<dyn Clock>,
    sessions: Arc<Semaphore>,
    config: OrchestratorConfig,
    rng: StdRng,
) -> SyncHandle
where
    S: Storage + 'static,
    R: ReplicaHandle + 'static,
    C: Connector,
{
    let trigger = Arc::new(Notify::new());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(SyncStatus::idle());

    let worker = Worker {
        storage,
        replica,
        connector,
        subscribers,
        clock,
        sessions,
        config,
        rng,
        trigger: Arc::clone(&trigger),
        cancel: cancel_rx,
        status: status_tx,
    };
    let task = tokio::spawn(worker.run());

    SyncHandle {
        trigger,
        cancel: cancel_tx,
        status: status_rx,
        task,
    }
}

struct Worker<S, R, C> {
    storage: Arc<S>,
    replica: Arc<R>,
    connector: C,
    subscribers: Arc<dyn QuerySubscribers>,
    clock: Arc<dyn Clock>,
    sessions: Arc<Semaphore>,
    config: OrchestratorConfig,
    rng: StdRng,
    trigger: Arc<Notify>,
    cancel: watch::Receiver<bool>,
    status: watch::Sender<SyncStatus>,
}

impl<S, R, C> Worker<S, R, C>
where
    S: Storage + 'static,
    R: ReplicaHandle + 'static,
    C: Connector,
{
    async fn run(mut self) {
        let owner = self.replica.owner_id();
        let mut attempt: u32 = 0;
        let mut retrying = false;

        loop {
            if retrying {
                let delay = self.config.backoff.delay(attempt, &mut self.rng);
                tracing::debug!(%owner, attempt, ?delay, "sync retry scheduled");
                tokio::select! {
                    _ = cancelled(&mut self.cancel) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::select! {
                    _ = cancelled(&mut self.cancel) => break,
                    _ = self.trigger.notified() => {}
                }
            }
            if *self.cancel.borrow() {
                break;
            }

            self.publish(SyncPhase::Syncing, None);
            match self.sync_once(owner).await {
                Ok(applied) => {
                    attempt = 0;
                    retrying = false;
                    if !applied.is_empty() {
                        self.subscribers.notify(owner, &applied);
                    }
                    let now = self.clock.now_millis();
                    self.status.send_modify(|status| {
                        status.phase = SyncPhase::Synced;
                        status.error = None;
                        status.last_synced_at = Some(now);
                    });
                }
                Err(SyncError::Cancelled) => break,
                Err(error) if error.is_transient() => {
                    tracing::warn!(%owner, %error, attempt, "transient sync failure");
                    attempt = attempt.saturating_add(1);
                    retrying = true;
                }
                Err(error) => {
                    tracing::warn!(%owner, %error, "sync failed");
                    attempt = 0;
                    retrying = false;
                    self.publish(SyncPhase::Error, Some(error.to_string()));
                }
            }
        }
    }

    async fn sync_once(&mut self, owner: OwnerId) -> Result<Vec<Timestamp>> {
        let permit = tokio::select! {
            _ = cancelled(&mut self.cancel) => return Err(SyncError::Cancelled),
            permit = Arc::clone(&self.sessions).acquire_owned() => {
                permit.map_err(|_| SyncError::Cancelled)?
            }
        };
        let _permit = permit;

        let transport = self.connector.connect().await?;
        let queued = self.replica.pending_uploads().await;
        let mut session = SyncSession::new(
            self.storage.as_ref(),
            &transport,
            self.replica.as_ref(),
            owner,
            self.replica.write_key(),
            self.config.session.clone(),
        );

        let mut cancel = self.cancel.clone();
        let report = tokio::select! {
            _ = cancelled(&mut cancel) => return Err(SyncError::Cancelled),
            report = session.run(&queued, &mut self.rng) => report?,
        };

        let acked: Vec<Timestamp> = queued.iter().map(|m| m.timestamp).collect();
        self.replica.clear_uploads(&acked).await;
        Ok(report.applied)
    }

    fn publish(&self, phase: SyncPhase, error: Option<String>) {
        self.status.send_modify(|status| {
            status.phase = phase;
            status.error = error;
        });
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ReconcileConfig;
    use crate::relay::RelayHandler;
    use crate::transport::memory::{self, MemoryTransport};
    use driftsync_core::{ManualClock, NodeId, Timestamp, TimestampRange};
    use driftsync_store::MemoryStorage;
    use rand::SeedableRng;
    use std::sync::Mutex;

    fn ts(millis: u64) -> Timestamp {
        Timestamp::new(millis, 0, NodeId::from_bytes([4; 8])).unwrap()
    }

    /// A replica handle over bare storage, queue in memory.
    struct TestReplica {
        owner: OwnerId,
        write_key: WriteKey,
        storage: Arc<MemoryStorage>,
        queue: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageSink for TestReplica {
        async fn apply(&self, owner: OwnerId, messages: Vec<Message>) -> Result<Vec<Timestamp>> {
            self.storage.write_messages(owner, &messages).await?;
            Ok(messages.into_iter().map(|m| m.timestamp).collect())
        }
    }

    #[async_trait]
    impl ReplicaHandle for TestReplica {
        fn owner_id(&self) -> OwnerId {
            self.owner
        }

        fn write_key(&self) -> WriteKey {
            self.write_key
        }

        async fn pending_uploads(&self) -> Vec<Message> {
            self.queue.lock().unwrap().clone()
        }

        async fn clear_uploads(&self, through: &[Timestamp]) {
            self.queue
                .lock()
                .unwrap()
                .retain(|m| !through.contains(&m.timestamp));
        }
    }

    /// Connector that spawns a relay serve task per connection.
    struct RelayConnector {
        relay_storage: Arc<MemoryStorage>,
    }

    #[async_trait]
    impl Connector for RelayConnector {
        type Transport = MemoryTransport;

        async fn connect(&self) -> Result<MemoryTransport> {
            let (client_end, server_end) = memory::pair(64);
            let relay = RelayHandler::new(
                Arc::clone(&self.relay_storage),
                ReconcileConfig::default(),
            );
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(1234);
                let _ = relay.serve(&server_end, &mut rng).await;
            });
            Ok(client_end)
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let config = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(config.delay(0, &mut rng), Duration::from_millis(100));
        assert_eq!(config.delay(1, &mut rng), Duration::from_millis(200));
        assert_eq!(config.delay(3, &mut rng), Duration::from_millis(800));
        assert_eq!(config.delay(20, &mut rng), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(2);
        for attempt in 0..8 {
            let base = 100.0 * 2f64.powi(attempt as i32);
            let base = base.min(10_000.0);
            let delay = config.delay(attempt, &mut rng).as_millis() as f64;
            assert!(delay >= base * 0.9 - 1.0 && delay <= base * 1.1 + 1.0);
        }
    }

    #[tokio::test]
    async fn test_orchestrated_sync_applies_and_notifies() {
        let mut rng = StdRng::seed_from_u64(3);
        let owner = OwnerId::random(&mut rng);
        let write_key = WriteKey::generate(&mut rng);

        let relay_storage = Arc::new(MemoryStorage::new());
        relay_storage
            .write_messages(owner, &[Message::new(ts(5), vec![0xAB])])
            .await
            .unwrap();

        let client_storage = Arc::new(MemoryStorage::new());
        let replica = Arc::new(TestReplica {
            owner,
            write_key,
            storage: Arc::clone(&client_storage),
            queue: Mutex::new(vec![]),
        });

        let subscribers = Arc::new(BroadcastSubscribers::new(16));
        let mut applied_rx = subscribers.subscribe();

        let handle = spawn_sync(
            Arc::clone(&client_storage),
            replica,
            RelayConnector {
                relay_storage: Arc::clone(&relay_storage),
            },
            subscribers,
            Arc::new(ManualClock::new(42_000)),
            Arc::new(Semaphore::new(DEFAULT_MAX_SESSIONS)),
            OrchestratorConfig::default(),
            StdRng::seed_from_u64(4),
        );

        handle.request_sync();
        let (notified_owner, applied) =
            tokio::time::timeout(Duration::from_secs(5), applied_rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(notified_owner, owner);
        assert_eq!(applied, vec![ts(5)]);

        let mut status = handle.watch_status();
        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if status.borrow().phase == SyncPhase::Synced {
                    return status.borrow().clone();
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(status.last_synced_at, Some(42_000));

        assert_eq!(
            client_storage.size(owner, TimestampRange::FULL).await.unwrap(),
            1
        );
        handle.dispose().await;
    }

    #[tokio::test]
    async fn test_upload_queue_drains_on_settle() {
        let mut rng = StdRng::seed_from_u64(5);
        let owner = OwnerId::random(&mut rng);
        let write_key = WriteKey::generate(&mut rng);

        let relay_storage = Arc::new(MemoryStorage::new());
        let client_storage = Arc::new(MemoryStorage::new());
        let queued = Message::new(ts(9), vec![0xEE]);
        client_storage
            .write_messages(owner, std::slice::from_ref(&queued))
            .await
            .unwrap();

        let replica = Arc::new(TestReplica {
            owner,
            write_key,
            storage: Arc::clone(&client_storage),
            queue: Mutex::new(vec![queued]),
        });

        let handle = spawn_sync(
            Arc::clone(&client_storage),
            Arc::clone(&replica),
            RelayConnector {
                relay_storage: Arc::clone(&relay_storage),
            },
            Arc::new(NoSubscribers),
            Arc::new(ManualClock::new(0)),
            Arc::new(Semaphore::new(1)),
            OrchestratorConfig::default(),
            StdRng::seed_from_u64(6),
        );

        handle.request_sync();
        let mut status = handle.watch_status();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if status.borrow().phase == SyncPhase::Synced {
                    return;
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert!(replica.pending_uploads().await.is_empty());
        assert_eq!(
            relay_storage.size(owner, TimestampRange::FULL).await.unwrap(),
            1
        );
        handle.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_stops_worker() {
        let mut rng = StdRng::seed_from_u64(7);
        let owner = OwnerId::random(&mut rng);
        let write_key = WriteKey::generate(&mut rng);
        let client_storage = Arc::new(MemoryStorage::new());
        let replica = Arc::new(TestReplica {
            owner,
            write_key,
            storage: Arc::clone(&client_storage),
            queue: Mutex::new(vec![]),
        });

        let handle = spawn_sync(
            client_storage,
            replica,
            RelayConnector {
                relay_storage: Arc::new(MemoryStorage::new()),
            },
            Arc::new(NoSubscribers),
            Arc::new(ManualClock::new(0)),
            Arc::new(Semaphore::new(1)),
            OrchestratorConfig::default(),
            StdRng::seed_from_u64(8),
        );

        // Disposal must resolve even though no sync was ever requested.
        tokio::time::timeout(Duration::from_secs(5), handle.dispose())
            .await
            .unwrap();
    }
}
