//! Deterministic fixtures for sync scenarios.
//!
//! Everything is seeded: clocks are manual, RNGs come from `StdRng`
//! seeds, and transports are in-memory pairs, so a failing scenario
//! replays byte-for-byte.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use driftsync::{Change, Clock, Config, ManualClock, MemoryStorage, Replica, Value};
use driftsync_core::Timestamp;
use driftsync_sync::transport::memory;
use driftsync_sync::{
    ReconcileConfig, RelayHandler, ReplicaHandle, SessionConfig, SyncError, SyncReport,
    SyncSession,
};

/// A replica with a manual clock over in-memory storage.
pub struct TestReplica {
    /// The wall clock driving the replica's HLC.
    pub clock: Arc<ManualClock>,
    /// The replica under test.
    pub replica: Replica<MemoryStorage>,
}

impl TestReplica {
    /// Create a replica with a fresh identity.
    pub fn new(seed: u64, start_millis: u64) -> Self {
        let clock = Arc::new(ManualClock::new(start_millis));
        let replica = Replica::new(
            &Config::default(),
            Arc::new(MemoryStorage::new()),
            Arc::clone(&clock) as Arc<dyn driftsync::Clock>,
            StdRng::seed_from_u64(seed),
        )
        .expect("fixture replica");
        Self { clock, replica }
    }

    /// Create another device holding the same owner.
    pub fn sibling(&self, seed: u64) -> Self {
        let clock = Arc::new(ManualClock::new(self.clock.now_millis()));
        let config = Config {
            mnemonic: Some(self.replica.mnemonic().to_string()),
            ..Config::default()
        };
        let replica = Replica::new(
            &config,
            Arc::new(MemoryStorage::new()),
            Arc::clone(&clock) as Arc<dyn driftsync::Clock>,
            StdRng::seed_from_u64(seed),
        )
        .expect("fixture sibling");
        Self { clock, replica }
    }

    /// Write one register.
    pub async fn write(&self, table: &str, row: &str, column: &str, value: Value) -> Timestamp {
        self.replica
            .mutate(&[Change::new(table, row, column, value)])
            .await
            .expect("fixture mutate")[0]
    }
}

/// A relay over in-memory storage.
pub struct TestRelay {
    /// The relay's message log.
    pub storage: Arc<MemoryStorage>,
    /// Reconciliation tunables used when serving.
    pub config: ReconcileConfig,
}

impl TestRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            config: ReconcileConfig::default(),
        }
    }

    /// Run one full session between a replica and this relay, draining
    /// the upload queue on success.
    pub async fn sync(&self, fixture: &TestReplica, seed: u64) -> Result<SyncReport, SyncError> {
        let (client_end, server_end) = memory::pair(64);
        let relay = RelayHandler::new(Arc::clone(&self.storage), self.config.clone());
        let serve = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed ^ 0xA5A5_A5A5);
            relay.serve(&server_end, &mut rng).await
        });

        let replica = &fixture.replica;
        let queued = replica.pending_uploads().await;
        let mut session = SyncSession::new(
            replica.storage().as_ref(),
            &client_end,
            replica,
            replica.owner_id(),
            replica.write_key(),
            SessionConfig {
                reconcile: self.config.clone(),
                ..SessionConfig::default()
            },
        );
        let mut rng = StdRng::seed_from_u64(seed);
        let result = session.run(&queued, &mut rng).await;

        if result.is_ok() {
            let acked: Vec<_> = queued.iter().map(|m| m.timestamp).collect();
            replica.clear_uploads(&acked).await;
        }

        drop(session);
        drop(client_end);
        serve.await.expect("relay task panicked")?;
        result
    }
}

impl Default for TestRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync::{Storage, TimestampRange};
    use driftsync_core::{Message, NodeId};
    use driftsync_sync::MessageSink;

    #[tokio::test]
    async fn test_fixture_sync_converges_siblings() {
        let a = TestReplica::new(1, 10_000);
        let b = a.sibling(2);
        let relay = TestRelay::new();

        a.write("todo", "r1", "title", Value::Text("hello".into()))
            .await;
        relay.sync(&a, 100).await.unwrap();
        relay.sync(&b, 101).await.unwrap();

        assert_eq!(
            b.replica.current_value("todo", "r1", "title").await.unwrap(),
            Some(Value::Text("hello".into()))
        );
    }

    #[tokio::test]
    async fn test_drift_aborts_whole_apply_batch() {
        let a = TestReplica::new(3, 10_000);
        let b = a.sibling(4);
        let owner = a.replica.owner_id();

        a.write("t", "r", "c", Value::Int(1)).await;
        let mut messages = a.replica.pending_uploads().await;
        // Append a message stamped far in the future.
        let future = Timestamp::new(10_000 + 1_000_000, 0, NodeId::from_bytes([9; 8])).unwrap();
        messages.push(Message::new(future, messages[0].change.clone()));

        let result = b.replica.apply(owner, messages).await;
        assert!(matches!(result, Err(SyncError::ClockDrift { .. })));

        // Nothing from the batch persisted.
        assert_eq!(
            b.replica
                .storage()
                .size(owner, TimestampRange::FULL)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_repeated_sync_is_idempotent() {
        let a = TestReplica::new(5, 10_000);
        let relay = TestRelay::new();
        let owner = a.replica.owner_id();

        a.write("t", "r", "c", Value::Int(7)).await;
        relay.sync(&a, 200).await.unwrap();
        let fp_once = relay
            .storage
            .fingerprint(owner, TimestampRange::FULL)
            .await
            .unwrap();

        for seed in 201..204 {
            relay.sync(&a, seed).await.unwrap();
        }
        let fp_after = relay
            .storage
            .fingerprint(owner, TimestampRange::FULL)
            .await
            .unwrap();
        assert_eq!(fp_once, fp_after);
        assert_eq!(
            relay.storage.size(owner, TimestampRange::FULL).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_small_list_threshold_still_converges() {
        let a = TestReplica::new(6, 50_000);
        let b = a.sibling(7);
        let mut relay = TestRelay::new();
        // Aggressive splitting: every mismatch subdivides quickly.
        relay.config = ReconcileConfig {
            list_threshold: 2,
            max_items_per_frame: 3,
        };
        let owner = a.replica.owner_id();

        for i in 0u64..20 {
            a.clock.advance(17);
            a.write("n", &format!("a{i}"), "v", Value::Int(i as i64)).await;
            b.clock.advance(13);
            b.write("n", &format!("b{i}"), "v", Value::Int(i as i64)).await;
        }

        relay.sync(&a, 300).await.unwrap();
        relay.sync(&b, 301).await.unwrap();
        relay.sync(&a, 302).await.unwrap();

        assert_eq!(
            a.replica
                .storage()
                .fingerprint(owner, TimestampRange::FULL)
                .await
                .unwrap(),
            b.replica
                .storage()
                .fingerprint(owner, TimestampRange::FULL)
                .await
                .unwrap()
        );
        assert_eq!(
            a.replica
                .storage()
                .size(owner, TimestampRange::FULL)
                .await
                .unwrap(),
            40
        );
    }
}
