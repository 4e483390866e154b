//! Error taxonomy for the cryptographic layer.
//!
//! Every failure reachable from network input maps to one of these enums;
//! none of them abort the process.

use thiserror::Error;

/// Failure to encode or decode an indistinguishable public key.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid representative length: expected 32, got {0}")]
    InvalidLength(usize),

    #[error("non-canonical representative")]
    NonCanonical,

    #[error("public key has no indistinguishable encoding")]
    NotEncodable,

    #[error("not a point on the curve")]
    InvalidPoint,

    #[error("invalid peer id")]
    InvalidPeerId,
}

/// Handshake failures. Recovery always means a new attempt with a fresh
/// ephemeral key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed handshake message: {0}")]
    Malformed(&'static str),

    #[error("handshake authentication failed")]
    AuthenticationFailed,

    #[error("handshake timed out")]
    Timeout,

    #[error("peer static key does not match pinned identity")]
    UnexpectedPeer,

    #[error("handshake step out of order: {0}")]
    InvalidState(&'static str),

    #[error("key derivation failed")]
    KeyDerivation,
}

/// Record and ratchet failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("record authentication failed")]
    AuthenticationFailed,

    #[error("replayed record: epoch {epoch} sequence {sequence}")]
    Replay { epoch: u32, sequence: u64 },

    #[error("skip of {requested} messages exceeds limit {limit}")]
    SkipLimitExceeded { requested: u64, limit: u64 },

    #[error("unknown epoch {0}")]
    UnknownEpoch(u32),

    #[error("message key for epoch {epoch} sequence {sequence} no longer available")]
    KeyUnavailable { epoch: u32, sequence: u64 },

    #[error("invalid rekey: {0}")]
    InvalidRekey(&'static str),

    #[error("sending chain exhausted")]
    ChainExhausted,

    #[error("record too large to seal")]
    RecordTooLarge,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

impl CryptoError {
    /// Replay and authentication failures drop the record but leave the
    /// session intact.
    pub fn is_drop_and_count(&self) -> bool {
        matches!(
            self,
            CryptoError::AuthenticationFailed
                | CryptoError::Replay { .. }
                | CryptoError::KeyUnavailable { .. }
                | CryptoError::UnknownEpoch(_)
                | CryptoError::SkipLimitExceeded { .. }
        )
    }
}
