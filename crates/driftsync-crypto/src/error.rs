//! Error types for the crypto crate.

use thiserror::Error;

/// Errors from encryption, decryption, and key derivation.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption error: {0}")]
    Encrypt(String),

    /// AEAD authentication failed: the ciphertext was tampered with or the
    /// key is wrong.
    #[error("decryption failed: tampered ciphertext or wrong key")]
    Decrypt,

    /// An envelope was structurally invalid before decryption.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Mnemonic generation or parsing failed.
    #[error("mnemonic error: {0}")]
    Mnemonic(String),
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
