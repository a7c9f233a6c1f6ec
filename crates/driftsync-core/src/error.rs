//! Error types for the core crate.

use thiserror::Error;

/// Errors from timestamp generation and binary codecs.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Local physical time is outside the acceptable drift window.
    #[error("clock drift of {drift_ms} ms exceeds the configured maximum")]
    ClockDrift {
        /// How far ahead of the wall clock the timestamp would be.
        drift_ms: u64,
    },

    /// Too many timestamps generated within one millisecond.
    #[error("timestamp counter overflow within a single millisecond")]
    CounterOverflow,

    /// Physical time does not fit the 48-bit field.
    #[error("physical time {0} ms exceeds the 48-bit timestamp range")]
    MillisOutOfRange(u64),

    /// Decoder ran out of input.
    #[error("truncated input: needed {needed} more bytes")]
    Truncated {
        /// How many bytes were missing.
        needed: usize,
    },

    /// Decoder finished with unconsumed input.
    #[error("{0} trailing bytes after decoding")]
    TrailingBytes(usize),

    /// A padded frame failed structural validation.
    #[error("invalid padding: {0}")]
    BadPadding(String),

    /// A length field exceeds the configured bound.
    #[error("length {len} exceeds maximum {max}")]
    LengthOverflow {
        /// The declared length.
        len: usize,
        /// The allowed maximum.
        max: usize,
    },

    /// Change serialization or deserialization failed.
    #[error("change serialization error: {0}")]
    Serialization(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
