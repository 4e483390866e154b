//! Inner frame codec.
//!
//! Frames are the plaintext carried inside an encrypted record. One record
//! may hold several frames back to back; each is self-delimiting. The codec
//! knows nothing about keys.
//!
//! # Header Format (28 bytes, big-endian)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |     Flags     |          Stream ID            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Offset (48 bits)                       |
//! +                               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                               |        Payload Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Frame Sequence (64 bits)                  |
//! +                                                               +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Padding Length         |     Reserved (must be zero)   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Payload ... | Padding (zeros) ...            |
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use shroud_crypto::RekeyProposal;
use thiserror::Error;

/// Fixed header size.
pub const FRAME_HEADER_SIZE: usize = 28;

/// Largest offset representable in the 48-bit field; a stream's final
/// byte position may not exceed it.
pub const MAX_OFFSET: u64 = (1u64 << 48) - 1;

/// Largest payload representable in the 16-bit length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Stream 0 carries session control frames.
pub const CONTROL_STREAM_ID: u16 = 0;

/// Stream ids below this are reserved for session control and never carry
/// DATA.
pub const FIRST_APPLICATION_STREAM_ID: u16 = 16;

/// Frame codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: {available} bytes, need {needed}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("invalid frame flags: 0x{0:02x}")]
    InvalidFlags(u8),

    #[error("reserved header bytes are not zero")]
    ReservedNonZero,

    #[error("offset {0} exceeds 48-bit range")]
    OffsetOverflow(u64),

    #[error("payload of {0} bytes exceeds frame limit")]
    PayloadTooLarge(usize),

    #[error("invalid {0} body")]
    InvalidBody(&'static str),
}

/// Frame types. Wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Stream bytes at an offset.
    Data = 0x01,
    /// Acknowledges received frames (for congestion control).
    Ack = 0x02,
    /// Flow-control signals such as backpressure.
    Control = 0x03,
    /// DH ratchet announcement or its acknowledgement.
    Rekey = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    /// Session teardown.
    Close = 0x07,
    /// Padding only; ignored on receipt.
    Pad = 0x08,
    StreamOpen = 0x09,
    StreamClose = 0x0a,
    StreamReset = 0x0b,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::Control),
            0x04 => Ok(Self::Rekey),
            0x05 => Ok(Self::Ping),
            0x06 => Ok(Self::Pong),
            0x07 => Ok(Self::Close),
            0x08 => Ok(Self::Pad),
            0x09 => Ok(Self::StreamOpen),
            0x0a => Ok(Self::StreamClose),
            0x0b => Ok(Self::StreamReset),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

impl FrameType {
    /// Whether the frame is counted and acknowledged by the peer.
    pub fn is_ack_eliciting(self) -> bool {
        !matches!(self, FrameType::Ack | FrameType::Pad)
    }
}

bitflags! {
    /// Frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// First frame of a stream.
        const SYN = 0x01;
        /// Last frame of a stream.
        const FIN = 0x02;
        /// Acknowledges a REKEY or CLOSE.
        const ACK = 0x04;
        const PRIORITY = 0x08;
        const COMPRESSED = 0x10;
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u16,
    pub offset: u64,
    /// Assigned by the sender when the frame is sealed.
    pub sequence: u64,
    pub payload: Bytes,
    pub padding_len: u16,
}

impl Frame {
    pub fn new(frame_type: FrameType, stream_id: u16, payload: Bytes) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::empty(),
            stream_id,
            offset: 0,
            sequence: 0,
            payload,
            padding_len: 0,
        }
    }

    pub fn data(stream_id: u16, offset: u64, payload: Bytes, flags: FrameFlags) -> Self {
        Self {
            offset,
            flags,
            ..Self::new(FrameType::Data, stream_id, payload)
        }
    }

    pub fn ack(body: AckBody) -> Self {
        Self::new(FrameType::Ack, CONTROL_STREAM_ID, body.encode())
    }

    pub fn control(body: ControlBody) -> Self {
        Self::new(FrameType::Control, CONTROL_STREAM_ID, body.encode())
    }

    pub fn rekey(proposal: &RekeyProposal) -> Self {
        Self::new(FrameType::Rekey, CONTROL_STREAM_ID, RekeyBody::from(*proposal).encode())
    }

    pub fn rekey_ack(epoch: u32) -> Self {
        let mut frame = Self::new(
            FrameType::Rekey,
            CONTROL_STREAM_ID,
            Bytes::copy_from_slice(&epoch.to_be_bytes()),
        );
        frame.flags = FrameFlags::ACK;
        frame
    }

    pub fn ping(payload: Bytes) -> Self {
        Self::new(FrameType::Ping, CONTROL_STREAM_ID, payload)
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(FrameType::Pong, CONTROL_STREAM_ID, payload)
    }

    pub fn close(body: &CloseBody) -> Self {
        Self::new(FrameType::Close, CONTROL_STREAM_ID, body.encode())
    }

    pub fn close_ack() -> Self {
        let mut frame = Self::new(FrameType::Close, CONTROL_STREAM_ID, Bytes::new());
        frame.flags = FrameFlags::ACK;
        frame
    }

    /// A frame that is nothing but `padding_len` zero bytes after its header.
    pub fn pad(padding_len: u16) -> Self {
        let mut frame = Self::new(FrameType::Pad, CONTROL_STREAM_ID, Bytes::new());
        frame.padding_len = padding_len;
        frame
    }

    pub fn stream_reset(stream_id: u16) -> Self {
        Self::new(FrameType::StreamReset, stream_id, Bytes::new())
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(FrameFlags::FIN)
    }

    /// Encoded size including padding.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + self.padding_len as usize
    }

    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let end = self.offset.saturating_add(self.payload.len() as u64);
        if self.offset > MAX_OFFSET || end > MAX_OFFSET + 1 {
            return Err(FrameError::OffsetOverflow(self.offset));
        }

        buf.reserve(self.encoded_len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.stream_id);
        buf.put_uint(self.offset, 6);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u64(self.sequence);
        buf.put_u16(self.padding_len);
        buf.put_bytes(0, 6);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, self.padding_len as usize);
        Ok(())
    }

    /// Decode one frame from the front of `buf`, consuming it.
    pub fn decode(buf: &mut Bytes) -> Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: FRAME_HEADER_SIZE,
                available: buf.len(),
            });
        }

        let mut header = &buf[..FRAME_HEADER_SIZE];
        let frame_type = FrameType::try_from(header.get_u8())?;
        let raw_flags = header.get_u8();
        let flags = FrameFlags::from_bits(raw_flags).ok_or(FrameError::InvalidFlags(raw_flags))?;
        let stream_id = header.get_u16();
        let offset = header.get_uint(6);
        let payload_len = header.get_u16() as usize;
        let sequence = header.get_u64();
        let padding_len = header.get_u16();
        if header.iter().any(|&b| b != 0) {
            return Err(FrameError::ReservedNonZero);
        }
        if offset.saturating_add(payload_len as u64) > MAX_OFFSET + 1 {
            return Err(FrameError::OffsetOverflow(offset));
        }

        let total = FRAME_HEADER_SIZE + payload_len + padding_len as usize;
        if buf.len() < total {
            return Err(FrameError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len);
        buf.advance(padding_len as usize);

        Ok(Self {
            frame_type,
            flags,
            stream_id,
            offset,
            sequence,
            payload,
            padding_len,
        })
    }

    /// Decode every frame in a record.
    pub fn decode_all(mut buf: Bytes) -> Result<Vec<Self>, FrameError> {
        let mut frames = Vec::new();
        while !buf.is_empty() {
            frames.push(Self::decode(&mut buf)?);
        }
        Ok(frames)
    }
}

/// ACK body: the largest frame sequence seen and how long the receiver
/// held it before acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBody {
    pub largest: u64,
    pub delay_micros: u32,
}

impl AckBody {
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64(self.largest);
        buf.put_u32(self.delay_micros);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() != Self::SIZE {
            return Err(FrameError::InvalidBody("ack"));
        }
        Ok(Self {
            largest: payload.get_u64(),
            delay_micros: payload.get_u32(),
        })
    }
}

/// CONTROL frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    /// Receiver's reorder buffer for a stream is full; data was dropped.
    Backpressure = 0x01,
}

impl TryFrom<u8> for ControlKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Backpressure),
            _ => Err(FrameError::InvalidBody("control")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBody {
    pub kind: ControlKind,
    pub stream_id: u16,
    /// Bytes currently buffered out of order.
    pub buffered: u32,
    /// Buffer limit.
    pub limit: u32,
}

impl ControlBody {
    pub const SIZE: usize = 11;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.stream_id);
        buf.put_u32(self.buffered);
        buf.put_u32(self.limit);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() != Self::SIZE {
            return Err(FrameError::InvalidBody("control"));
        }
        Ok(Self {
            kind: ControlKind::try_from(payload.get_u8())?,
            stream_id: payload.get_u16(),
            buffered: payload.get_u32(),
            limit: payload.get_u32(),
        })
    }
}

/// REKEY body (without the ACK flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyBody {
    pub new_epoch: u32,
    pub peer_key_epoch: u32,
    pub public: [u8; 32],
}

impl RekeyBody {
    pub const SIZE: usize = 40;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.new_epoch);
        buf.put_u32(self.peer_key_epoch);
        buf.put_slice(&self.public);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() != Self::SIZE {
            return Err(FrameError::InvalidBody("rekey"));
        }
        let new_epoch = payload.get_u32();
        let peer_key_epoch = payload.get_u32();
        let mut public = [0u8; 32];
        payload.copy_to_slice(&mut public);
        Ok(Self {
            new_epoch,
            peer_key_epoch,
            public,
        })
    }

    /// Epoch carried by a REKEY|ACK.
    pub fn decode_ack(mut payload: &[u8]) -> Result<u32, FrameError> {
        if payload.len() != 4 {
            return Err(FrameError::InvalidBody("rekey ack"));
        }
        Ok(payload.get_u32())
    }
}

impl From<RekeyProposal> for RekeyBody {
    fn from(p: RekeyProposal) -> Self {
        Self {
            new_epoch: p.new_epoch,
            peer_key_epoch: p.peer_key_epoch,
            public: p.public,
        }
    }
}

impl From<RekeyBody> for RekeyProposal {
    fn from(b: RekeyBody) -> Self {
        Self {
            new_epoch: b.new_epoch,
            peer_key_epoch: b.peer_key_epoch,
            public: b.public,
        }
    }
}

/// Close codes.
pub mod close_code {
    pub const NORMAL: u16 = 0x0000;
    pub const PROTOCOL_VIOLATION: u16 = 0x0001;
    pub const IDLE: u16 = 0x0002;
}

/// Longest close reason sent or accepted.
pub const MAX_CLOSE_REASON: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseBody {
    pub code: u16,
    pub reason: String,
}

impl CloseBody {
    pub fn encode(&self) -> Bytes {
        let mut end = self.reason.len().min(MAX_CLOSE_REASON);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }
        let reason = &self.reason.as_bytes()[..end];
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(self.code);
        buf.put_slice(reason);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < 2 || payload.len() > 2 + MAX_CLOSE_REASON {
            return Err(FrameError::InvalidBody("close"));
        }
        let code = payload.get_u16();
        let reason =
            String::from_utf8(payload.to_vec()).map_err(|_| FrameError::InvalidBody("close"))?;
        Ok(Self { code, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), frame.encoded_len());
        let mut bytes = buf.freeze();
        let decoded = Frame::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        decoded
    }

    #[test]
    fn test_header_layout() {
        let mut frame = Frame::data(
            0x1234,
            0x0102_0304_0506,
            Bytes::from_static(b"abc"),
            FrameFlags::FIN,
        );
        frame.sequence = 7;
        frame.padding_len = 2;

        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();

        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 3 + 2);
        assert_eq!(buf[0], FrameType::Data as u8);
        assert_eq!(buf[1], FrameFlags::FIN.bits());
        assert_eq!(&buf[2..4], &[0x12, 0x34]);
        assert_eq!(&buf[4..10], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&buf[10..12], &[0, 3]);
        assert_eq!(&buf[12..20], &7u64.to_be_bytes());
        assert_eq!(&buf[20..22], &[0, 2]);
        assert_eq!(&buf[22..28], &[0u8; 6]);
        assert_eq!(&buf[28..31], b"abc");
        assert_eq!(&buf[31..], &[0, 0]);
    }

    #[test]
    fn test_all_types_roundtrip() {
        let proposal = RekeyProposal {
            new_epoch: 3,
            peer_key_epoch: 2,
            public: [9u8; 32],
        };
        let frames = vec![
            Frame::data(20, 100, Bytes::from_static(b"payload"), FrameFlags::SYN),
            Frame::ack(AckBody {
                largest: 99,
                delay_micros: 250,
            }),
            Frame::control(ControlBody {
                kind: ControlKind::Backpressure,
                stream_id: 20,
                buffered: 4096,
                limit: 4096,
            }),
            Frame::rekey(&proposal),
            Frame::rekey_ack(3),
            Frame::ping(Bytes::from_static(b"p")),
            Frame::pong(Bytes::from_static(b"p")),
            Frame::close(&CloseBody {
                code: close_code::NORMAL,
                reason: "bye".into(),
            }),
            Frame::close_ack(),
            Frame::pad(64),
            Frame::new(FrameType::StreamOpen, 30, Bytes::new()),
            Frame::new(FrameType::StreamClose, 30, Bytes::new()),
            Frame::stream_reset(30),
        ];
        for frame in &frames {
            assert_eq!(&roundtrip(frame), frame);
        }
    }

    #[test]
    fn test_coalesced_frames() {
        let mut buf = BytesMut::new();
        Frame::data(16, 0, Bytes::from_static(b"one"), FrameFlags::empty())
            .encode(&mut buf)
            .unwrap();
        Frame::pad(10).encode(&mut buf).unwrap();
        Frame::data(17, 0, Bytes::from_static(b"two"), FrameFlags::FIN)
            .encode(&mut buf)
            .unwrap();

        let frames = Frame::decode_all(buf.freeze()).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload, Bytes::from_static(b"one"));
        assert_eq!(frames[1].frame_type, FrameType::Pad);
        assert!(frames[2].is_fin());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = Bytes::from(vec![0u8; FRAME_HEADER_SIZE]);
        assert_eq!(Frame::decode(&mut bytes), Err(FrameError::UnknownType(0)));

        let mut raw = vec![0u8; FRAME_HEADER_SIZE];
        raw[0] = 0x0c;
        assert_eq!(
            Frame::decode(&mut Bytes::from(raw)),
            Err(FrameError::UnknownType(0x0c))
        );
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let mut raw = vec![0u8; FRAME_HEADER_SIZE];
        raw[0] = FrameType::Ping as u8;
        raw[1] = 0x80;
        assert_eq!(
            Frame::decode(&mut Bytes::from(raw)),
            Err(FrameError::InvalidFlags(0x80))
        );
    }

    #[test]
    fn test_reserved_must_be_zero() {
        let mut raw = vec![0u8; FRAME_HEADER_SIZE];
        raw[0] = FrameType::Ping as u8;
        raw[27] = 1;
        assert_eq!(
            Frame::decode(&mut Bytes::from(raw)),
            Err(FrameError::ReservedNonZero)
        );
    }

    #[test]
    fn test_truncated_payload() {
        let mut buf = BytesMut::new();
        Frame::data(16, 0, Bytes::from_static(b"abcdef"), FrameFlags::empty())
            .encode(&mut buf)
            .unwrap();
        let mut short = buf.freeze().slice(..FRAME_HEADER_SIZE + 3);
        assert_eq!(
            Frame::decode(&mut short),
            Err(FrameError::Truncated {
                needed: FRAME_HEADER_SIZE + 6,
                available: FRAME_HEADER_SIZE + 3
            })
        );
    }

    #[test]
    fn test_offset_limits() {
        let at_limit = Frame::data(16, MAX_OFFSET, Bytes::from_static(b"x"), FrameFlags::empty());
        assert_eq!(roundtrip(&at_limit).offset, MAX_OFFSET);

        let over = Frame::data(16, MAX_OFFSET, Bytes::from_static(b"xy"), FrameFlags::empty());
        assert_eq!(
            over.encode(&mut BytesMut::new()),
            Err(FrameError::OffsetOverflow(MAX_OFFSET))
        );
        let way_over = Frame::data(16, 1 << 48, Bytes::new(), FrameFlags::empty());
        assert!(way_over.encode(&mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_payload_too_large() {
        let frame = Frame::data(
            16,
            0,
            Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]),
            FrameFlags::empty(),
        );
        assert_eq!(
            frame.encode(&mut BytesMut::new()),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let body = CloseBody {
            code: close_code::IDLE,
            reason: "é".repeat(200),
        };
        let encoded = body.encode();
        assert!(encoded.len() <= 2 + MAX_CLOSE_REASON);
        let decoded = CloseBody::decode(&encoded).unwrap();
        assert_eq!(decoded.code, close_code::IDLE);
        assert_eq!(decoded.reason.chars().count(), 128);
    }

    #[test]
    fn test_body_length_checks() {
        assert!(AckBody::decode(&[0u8; 11]).is_err());
        assert!(ControlBody::decode(&[0u8; 11]).is_err());
        assert!(RekeyBody::decode(&[0u8; 39]).is_err());
        assert!(RekeyBody::decode_ack(&[0u8; 5]).is_err());
        assert!(CloseBody::decode(&[0u8; 1]).is_err());
    }
}
