//! Error types for the store crate.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored bytes failed to decode.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A rank query was out of bounds for its range.
    #[error("rank {rank} out of bounds for range of size {size}")]
    RankOutOfBounds {
        /// Requested rank.
        rank: u64,
        /// Number of timestamps in the range.
        size: u64,
    },

    /// The storage worker went away.
    #[error("storage worker unavailable: {0}")]
    WorkerGone(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
