//! Non-initiator frame handling: the relay endpoint's core.
//!
//! A relay is an untrusted buffer. Per frame it decodes, checks the
//! protocol version, validates the write key before anything is written,
//! runs one reconciliation step, persists uploads atomically, and encodes
//! the response. No session state is kept between frames, which is what
//! lets one handler serve any number of concurrent clients.
//!
//! The same handler backs peer-to-peer sync: point it at another client's
//! storage instead of a relay database.

use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;

use driftsync_store::Storage;

use crate::error::{Result, SyncError};
use crate::messages::{ErrorCode, Frame};
use crate::reconcile::{ReconcileConfig, Reconciler};
use crate::transport::Transport;

/// Stateless responder over a storage backend.
pub struct RelayHandler<S: Storage + ?Sized> {
    storage: Arc<S>,
    config: ReconcileConfig,
}

impl<S: Storage + ?Sized> RelayHandler<S> {
    /// Create a handler.
    pub fn new(storage: Arc<S>, config: ReconcileConfig) -> Self {
        Self { storage, config }
    }

    /// Handle one padded frame and produce the padded response.
    ///
    /// Failures become Error frames on the wire; only response encoding
    /// itself can fail.
    pub async fn handle_frame(&self, frame: &[u8], rng: &mut (impl RngCore + Send)) -> Result<Bytes> {
        let response = match self.process(frame).await {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%error, "sync frame rejected");
                error_frame(&error)
            }
        };
        response.encode_padded(rng)
    }

    async fn process(&self, frame: &[u8]) -> Result<Frame> {
        let frame = Frame::decode_padded(frame)?;
        let Frame::Initiator {
            owner,
            write_key,
            ranges,
        } = frame
        else {
            return Err(SyncError::Protocol(
                "expected an initiator frame".into(),
            ));
        };

        if !self
            .storage
            .validate_write_key(owner, &write_key)
            .await?
        {
            return Err(SyncError::WriteKeyInvalid);
        }

        let reconciler = Reconciler::new(self.storage.as_ref(), owner, self.config.clone());
        let step = reconciler.respond(&ranges).await?;
        if !step.to_write.is_empty() {
            self.storage.write_messages(owner, &step.to_write).await?;
        }

        Ok(Frame::NonInitiator {
            owner,
            ranges: step.ranges,
        })
    }

    /// Serve a transport until the peer closes it.
    pub async fn serve<T: Transport + ?Sized>(
        &self,
        transport: &T,
        rng: &mut (impl RngCore + Send),
    ) -> Result<()> {
        while let Some(frame) = transport.recv().await? {
            let response = self.handle_frame(&frame, rng).await?;
            transport.send(response).await?;
        }
        Ok(())
    }
}

/// Map a failure onto its wire representation.
///
/// Storage details stay in the logs; the wire only learns that
/// persistence failed.
fn error_frame(error: &SyncError) -> Frame {
    let (code, detail) = match error {
        SyncError::WriteKeyInvalid => (ErrorCode::WriteKeyInvalid, "write key rejected".into()),
        SyncError::VersionUnsupported { local, peer } => (
            ErrorCode::VersionUnsupported,
            format!("supported version {local}, got {peer}"),
        ),
        SyncError::ClockDrift { drift_ms } => {
            (ErrorCode::ClockDrift, format!("drift of {drift_ms} ms"))
        }
        SyncError::Storage(_) => (ErrorCode::Storage, "persistence failure".into()),
        other => (ErrorCode::Protocol, other.to_string()),
    };
    Frame::Error { code, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{RangeEntry, RangePayload, PROTOCOL_VERSION};
    use driftsync_core::{Message, NodeId, OwnerId, Timestamp, TimestampRange};
    use driftsync_crypto::WriteKey;
    use driftsync_store::MemoryStorage;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn handler() -> RelayHandler<MemoryStorage> {
        RelayHandler::new(Arc::new(MemoryStorage::new()), ReconcileConfig::default())
    }

    fn empty_initiator(owner: OwnerId, write_key: WriteKey) -> Frame {
        Frame::Initiator {
            owner,
            write_key,
            ranges: vec![RangeEntry {
                upper: Timestamp::MAX,
                payload: RangePayload::TimestampsList {
                    timestamps: vec![],
                    has_more: false,
                },
            }],
        }
    }

    #[tokio::test]
    async fn test_responds_non_initiator() {
        let relay = handler();
        let mut rng = StdRng::seed_from_u64(1);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);

        let request = empty_initiator(owner, key).encode_padded(&mut rng).unwrap();
        let response = relay.handle_frame(&request, &mut rng).await.unwrap();

        match Frame::decode_padded(&response).unwrap() {
            Frame::NonInitiator { owner: o, .. } => assert_eq!(o, owner),
            other => panic!("expected non-initiator, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_write_key() {
        let relay = handler();
        let mut rng = StdRng::seed_from_u64(2);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);
        let wrong = WriteKey::generate(&mut rng);

        // First contact registers the key.
        let request = empty_initiator(owner, key).encode_padded(&mut rng).unwrap();
        relay.handle_frame(&request, &mut rng).await.unwrap();

        let request = empty_initiator(owner, wrong).encode_padded(&mut rng).unwrap();
        let response = relay.handle_frame(&request, &mut rng).await.unwrap();
        match Frame::decode_padded(&response).unwrap() {
            Frame::Error { code, .. } => assert_eq!(code, ErrorCode::WriteKeyInvalid),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_write_key_persists_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let relay = RelayHandler::new(Arc::clone(&storage), ReconcileConfig::default());
        let mut rng = StdRng::seed_from_u64(3);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);
        let wrong = WriteKey::generate(&mut rng);

        let register = empty_initiator(owner, key).encode_padded(&mut rng).unwrap();
        relay.handle_frame(&register, &mut rng).await.unwrap();

        let upload = Frame::Initiator {
            owner,
            write_key: wrong,
            ranges: vec![RangeEntry {
                upper: Timestamp::MAX,
                payload: RangePayload::TimestampsListWithChanges {
                    items: vec![(
                        Timestamp::new(5, 0, NodeId::from_bytes([1; 8])).unwrap(),
                        Some(Bytes::from_static(b"cipher")),
                    )],
                    has_more: false,
                },
            }],
        };
        let request = upload.encode_padded(&mut rng).unwrap();
        relay.handle_frame(&request, &mut rng).await.unwrap();

        assert_eq!(storage.size(owner, TimestampRange::FULL).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_unknown_version() {
        let relay = handler();
        let mut rng = StdRng::seed_from_u64(4);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);

        let mut body = empty_initiator(owner, key).encode().unwrap();
        body[1] = PROTOCOL_VERSION + 1;
        let padded = driftsync_core::codec::pad_frame(&body, &mut rng).unwrap();

        let response = relay.handle_frame(&padded, &mut rng).await.unwrap();
        match Frame::decode_padded(&response).unwrap() {
            Frame::Error { code, .. } => assert_eq!(code, ErrorCode::VersionUnsupported),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accepts_upload_and_stores() {
        let storage = Arc::new(MemoryStorage::new());
        let relay = RelayHandler::new(Arc::clone(&storage), ReconcileConfig::default());
        let mut rng = StdRng::seed_from_u64(5);
        let owner = OwnerId::random(&mut rng);
        let key = WriteKey::generate(&mut rng);

        let ts = Timestamp::new(5, 0, NodeId::from_bytes([1; 8])).unwrap();
        let upload = Frame::Initiator {
            owner,
            write_key: key,
            ranges: vec![RangeEntry {
                upper: Timestamp::MAX,
                payload: RangePayload::TimestampsListWithChanges {
                    items: vec![(ts, Some(Bytes::from_static(b"cipher")))],
                    has_more: false,
                },
            }],
        };
        let request = upload.encode_padded(&mut rng).unwrap();
        relay.handle_frame(&request, &mut rng).await.unwrap();

        assert_eq!(
            storage.read_change(owner, ts).await.unwrap().unwrap(),
            Message::new(ts, Bytes::from_static(b"cipher")).change
        );
    }

    #[tokio::test]
    async fn test_garbage_frame_yields_protocol_error() {
        let relay = handler();
        let mut rng = StdRng::seed_from_u64(6);
        let garbage = driftsync_core::codec::pad_frame(b"not a frame", &mut rng).unwrap();
        let response = relay.handle_frame(&garbage, &mut rng).await.unwrap();
        match Frame::decode_padded(&response).unwrap() {
            Frame::Error { code, .. } => assert_eq!(code, ErrorCode::Protocol),
            other => panic!("expected error frame, got {other:?}"),
        }
    }
}
