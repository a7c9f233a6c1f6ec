//! Error type for the facade crate.

use thiserror::Error;

/// Errors surfaced by the replica API.
#[derive(Debug, Error)]
pub enum Error {
    /// Timestamp or codec failure.
    #[error(transparent)]
    Core(#[from] driftsync_core::CoreError),

    /// Encryption, decryption, or key-derivation failure.
    #[error(transparent)]
    Crypto(#[from] driftsync_crypto::CryptoError),

    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] driftsync_store::StorageError),

    /// Synchronization failure.
    #[error(transparent)]
    Sync(#[from] driftsync_sync::SyncError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for replica operations.
pub type Result<T> = std::result::Result<T, Error>;
