//! # driftsync-sync
//!
//! The replication protocol: range-based set reconciliation over hybrid
//! logical clock timestamps, framed for an untrusted relay.
//!
//! ## Layers
//!
//! - [`messages`] - wire frames (Initiator / NonInitiator / Error) with
//!   the PADMÉ-padded binary codec
//! - [`reconcile`] - the stateless reconciliation step function
//! - [`protocol`] - the initiator-side session state machine
//! - [`relay`] - the stateless non-initiator frame handler
//! - [`transport`] - the framed-channel abstraction and test transports
//! - [`orchestrator`] - per-owner retry loop, status observable,
//!   subscriber fan-out
//!
//! ## Convergence
//!
//! After a session settles, both parties hold the union of their message
//! sets for the owner, within `O(log n)` rounds of the symmetric
//! difference, because mismatched fingerprint ranges split at the median
//! and small ranges degrade to explicit lists.

pub mod error;
pub mod messages;
pub mod orchestrator;
pub mod protocol;
pub mod reconcile;
pub mod relay;
pub mod transport;

pub use error::{Result, SyncError};
pub use messages::{all_skip, ErrorCode, Frame, RangeEntry, RangePayload, PROTOCOL_VERSION};
pub use orchestrator::{
    spawn_sync, BackoffConfig, BroadcastSubscribers, Connector, NoSubscribers, OrchestratorConfig,
    QuerySubscribers, ReplicaHandle, SyncHandle, SyncPhase, SyncStatus, DEFAULT_MAX_SESSIONS,
};
pub use protocol::{
    MessageSink, SessionConfig, SessionState, StorageSink, SyncReport, SyncSession,
};
pub use reconcile::{ReconcileConfig, ReconcileStep, Reconciler};
pub use relay::RelayHandler;
pub use transport::{length_prefix, split_length_prefixed, Transport};
