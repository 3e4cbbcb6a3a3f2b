//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Authentication failure, truncated frame, or out-of-order frame
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// The local stream header was already handed out
    #[error("stream header was already consumed")]
    HeaderAlreadyConsumed,

    /// The pull state was already initialized from a peer header
    #[error("pull state was already initialized")]
    AlreadyInitialized,

    /// Decrypt attempted before the peer header arrived
    #[error("pull state is not initialized")]
    NotInitialized,

    /// The peer already ended its stream with a FINAL tag
    #[error("stream was finalized by peer")]
    StreamFinished,

    /// Peer header has the wrong length
    #[error("invalid stream header length: expected {expected}, got {actual}")]
    InvalidHeader {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Tag byte outside the secretstream tag set
    #[error("unknown stream tag: 0x{0:02X}")]
    UnknownTag(u8),

    /// Invalid public key (wrong length or low-order point)
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
