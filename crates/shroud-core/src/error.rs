//! Session error taxonomy.

use crate::frame::{FrameError, FrameType};
use crate::packet::PacketError;
use crate::session::SessionState;
use shroud_crypto::{CryptoError, HandshakeError};
use thiserror::Error;

/// Peer sent something the protocol does not allow. Individually these are
/// dropped and counted; a session fails only after repeated violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("DATA on reserved stream {0}")]
    ReservedStream(u16),

    #[error("payload of {len} bytes exceeds limit {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("stream {stream_id} offset overflow at {offset}")]
    OffsetOverflow { stream_id: u16, offset: u64 },

    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),

    #[error("malformed: {0}")]
    Malformed(&'static str),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}

/// Operation not valid in the session's current state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("session inactive ({0:?})")]
    Inactive(SessionState),

    #[error("session not established")]
    NotEstablished,

    #[error("unknown session")]
    UnknownSession,

    #[error("half-open session limit of {0} reached")]
    HalfOpenLimit(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("state: {0}")]
    State(#[from] StateError),

    #[error("internal: {0}")]
    Internal(&'static str),
}

impl SessionError {
    /// Whether the error ended the session. Everything else was dropped and
    /// counted, or rejected without side effects.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Handshake(HandshakeError::Timeout) => true,
            SessionError::Handshake(_) => false,
            SessionError::Crypto(e) => !e.is_drop_and_count(),
            SessionError::Protocol(_) => false,
            SessionError::State(_) => false,
            SessionError::Internal(_) => true,
        }
    }
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        SessionError::Protocol(e.into())
    }
}

impl From<PacketError> for SessionError {
    fn from(e: PacketError) -> Self {
        SessionError::Protocol(e.into())
    }
}
