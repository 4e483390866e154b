//! Outer datagram layout.
//!
//! ```text
//! [Connection ID (8B)][Epoch (4B)][Sequence (8B)][Body ...]
//! ```
//!
//! Transport packets carry one sealed record as the body: encrypted frames
//! followed by the 16-byte tag. The epoch and sequence select the message
//! key and feed the nonce; the first 20 bytes are bound into the tag as
//! associated data.
//!
//! Handshake packets use epoch `HANDSHAKE_EPOCH` and carry the handshake
//! message number (1, 2 or 3) in the sequence field. Their bodies are the
//! raw Noise messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use shroud_common::helpers::short_hex;
use shroud_crypto::record::TAG_LEN;
use std::fmt;
use thiserror::Error;

pub const CONNECTION_ID_LEN: usize = 8;

/// Connection ID, epoch and sequence.
pub const PACKET_HEADER_SIZE: usize = CONNECTION_ID_LEN + 4 + 8;

/// Reserved epoch marking handshake packets.
pub const HANDSHAKE_EPOCH: u32 = u32::MAX;

/// Smallest valid transport packet: header plus an empty record's tag.
pub const MIN_TRANSPORT_PACKET: usize = PACKET_HEADER_SIZE + TAG_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} < {1}")]
    TooShort(usize, usize),

    #[error("invalid handshake message number: {0}")]
    InvalidHandshakeMessage(u64),
}

/// Cleartext session identifier chosen by the initiator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub [u8; CONNECTION_ID_LEN]);

impl ConnectionId {
    pub fn random() -> Self {
        let mut id = [0u8; CONNECTION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; CONNECTION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&short_hex(&self.0))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// Which handshake message a packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeMessage {
    First = 1,
    Second = 2,
    Third = 3,
}

impl TryFrom<u64> for HandshakeMessage {
    type Error = PacketError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::First),
            2 => Ok(Self::Second),
            3 => Ok(Self::Third),
            _ => Err(PacketError::InvalidHandshakeMessage(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub connection_id: ConnectionId,
    pub epoch: u32,
    pub sequence: u64,
    pub body: Bytes,
}

impl Packet {
    pub fn handshake(connection_id: ConnectionId, message: HandshakeMessage, body: Bytes) -> Self {
        Self {
            connection_id,
            epoch: HANDSHAKE_EPOCH,
            sequence: message as u64,
            body,
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.epoch == HANDSHAKE_EPOCH
    }

    /// Handshake message number, if this is a handshake packet.
    pub fn handshake_message(&self) -> Result<Option<HandshakeMessage>, PacketError> {
        if !self.is_handshake() {
            return Ok(None);
        }
        HandshakeMessage::try_from(self.sequence).map(Some)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.body.len());
        buf.put_slice(&self.connection_id.0);
        buf.put_u32(self.epoch);
        buf.put_u64(self.sequence);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, PacketError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort(bytes.len(), PACKET_HEADER_SIZE));
        }

        let mut id = [0u8; CONNECTION_ID_LEN];
        bytes.copy_to_slice(&mut id);
        let epoch = bytes.get_u32();
        let sequence = bytes.get_u64();

        let packet = Self {
            connection_id: ConnectionId(id),
            epoch,
            sequence,
            body: bytes,
        };
        if !packet.is_handshake() && packet.body.len() < TAG_LEN {
            return Err(PacketError::TooShort(
                PACKET_HEADER_SIZE + packet.body.len(),
                MIN_TRANSPORT_PACKET,
            ));
        }
        Ok(packet)
    }
}

/// Associated-data context for a session's records: the connection ID.
/// The record layer appends epoch and sequence, so the tag covers the whole
/// cleartext header.
pub fn record_context(connection_id: &ConnectionId) -> &[u8] {
    &connection_id.0
}
