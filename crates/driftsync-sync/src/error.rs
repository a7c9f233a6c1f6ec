//! Error types for the sync crate.
//!
//! This is the error taxonomy the orchestrator's retry policy is written
//! against: transient failures are retried with backoff, protocol-level
//! failures terminate the session, and a few conditions escalate straight
//! to the application.

use thiserror::Error;

use driftsync_core::CoreError;
use driftsync_crypto::CryptoError;
use driftsync_store::StorageError;

/// Errors that can occur during synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol version mismatch with peer.
    #[error("protocol version unsupported: local={local}, peer={peer}")]
    VersionUnsupported {
        /// Our protocol version.
        local: u8,
        /// The peer's protocol version.
        peer: u8,
    },

    /// The relay rejected our write key.
    #[error("write key rejected by relay")]
    WriteKeyInvalid,

    /// A timestamp was too far ahead of the local wall clock.
    #[error("clock drift of {drift_ms} ms exceeds the configured maximum")]
    ClockDrift {
        /// Observed drift in milliseconds.
        drift_ms: u64,
    },

    /// Too many local timestamps within one millisecond.
    #[error("timestamp counter overflow")]
    CounterOverflow,

    /// AEAD authentication failed on a received message.
    #[error("decryption failed: tampered ciphertext or wrong key")]
    Decrypt,

    /// Malformed or out-of-order protocol data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer reported an error we could not classify further.
    #[error("peer error: {0}")]
    Peer(String),

    /// Store operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the connection.
    #[error("transport closed by peer")]
    TransportClosed,

    /// No frame arrived within the per-round timeout.
    #[error("timed out {0}")]
    Timeout(String),

    /// The session was cooperatively cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the orchestrator should retry after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_)
                | SyncError::TransportClosed
                | SyncError::Timeout(_)
                | SyncError::Storage(_)
        )
    }

    /// Whether the application must be told rather than retried.
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            SyncError::ClockDrift { .. } | SyncError::Decrypt | SyncError::WriteKeyInvalid
        )
    }
}

impl From<CoreError> for SyncError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::ClockDrift { drift_ms } => SyncError::ClockDrift { drift_ms },
            CoreError::CounterOverflow => SyncError::CounterOverflow,
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

impl From<CryptoError> for SyncError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Decrypt => SyncError::Decrypt,
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
