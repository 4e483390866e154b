//! Stream multiplexer.
//!
//! Each application stream is an ordered byte sequence addressed by offset.
//! DATA frames may arrive in any order; the receive side buffers gaps in a
//! per-stream reorder map and releases bytes strictly in offset order.
//!
//! Receive-side rules:
//! - Streams `0..16` are reserved; DATA for them is a protocol violation.
//! - Bytes already delivered are trimmed from retransmitted or overlapping
//!   frames, so every byte is delivered once.
//! - Out-of-order bytes are bounded by `max_reorder_bytes` per stream. A
//!   frame that would exceed it is dropped and reported as backpressure.
//! - A stream closes once its FIN offset has been reached, or after the idle
//!   timeout if nothing is buffered.

use crate::error::ProtocolError;
use crate::frame::{
    ControlBody, ControlKind, Frame, FrameFlags, FIRST_APPLICATION_STREAM_ID, MAX_OFFSET,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub max_frame_payload: usize,
    pub max_reorder_bytes: usize,
    pub idle_timeout: Duration,
}

/// In-order bytes released to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    pub stream_id: u16,
    pub data: Bytes,
    /// Set on the last chunk of a stream.
    pub fin: bool,
}

/// What happened to one inbound DATA frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    Accepted,
    /// Every byte was already delivered or buffered.
    Duplicate,
    /// Dropped; the reorder buffer is full.
    Backpressure(ControlBody),
}

struct RecvStream {
    next_offset: u64,
    pending: BTreeMap<u64, Bytes>,
    pending_bytes: usize,
    fin_offset: Option<u64>,
    last_activity: Instant,
}

impl RecvStream {
    fn new(now: Instant) -> Self {
        Self {
            next_offset: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            fin_offset: None,
            last_activity: now,
        }
    }

    /// Pop buffered segments that have become contiguous.
    fn drain_pending(&mut self, out: &mut Vec<Bytes>) {
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > self.next_offset {
                break;
            }
            let chunk = entry.remove();
            self.pending_bytes -= chunk.len();
            let end = start + chunk.len() as u64;
            if end <= self.next_offset {
                continue;
            }
            let skip = (self.next_offset - start) as usize;
            out.push(chunk.slice(skip..));
            self.next_offset = end;
        }
    }
}

struct SendStream {
    next_offset: u64,
    fin_sent: bool,
    last_activity: Instant,
}

pub struct StreamMultiplexer {
    config: StreamConfig,
    recv: HashMap<u16, RecvStream>,
    send: HashMap<u16, SendStream>,
    /// Receive streams that reached FIN or were reset; late frames for them
    /// are duplicates until the entry ages out.
    finished: HashMap<u16, Instant>,
    ready: VecDeque<ReceivedData>,
}

fn check_application_stream(stream_id: u16) -> Result<(), ProtocolError> {
    if stream_id < FIRST_APPLICATION_STREAM_ID {
        return Err(ProtocolError::ReservedStream(stream_id));
    }
    Ok(())
}

fn end_offset(stream_id: u16, offset: u64, len: usize) -> Result<u64, ProtocolError> {
    offset
        .checked_add(len as u64)
        .filter(|end| *end <= MAX_OFFSET + 1)
        .ok_or(ProtocolError::OffsetOverflow { stream_id, offset })
}

impl StreamMultiplexer {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            recv: HashMap::new(),
            send: HashMap::new(),
            finished: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Feed one inbound DATA frame.
    pub fn on_data(
        &mut self,
        stream_id: u16,
        offset: u64,
        payload: Bytes,
        fin: bool,
        now: Instant,
    ) -> Result<DataOutcome, ProtocolError> {
        check_application_stream(stream_id)?;
        let end = end_offset(stream_id, offset, payload.len())?;
        if self.finished.contains_key(&stream_id) {
            return Ok(DataOutcome::Duplicate);
        }

        let limit = self.config.max_reorder_bytes;
        let stream = self.recv.entry(stream_id).or_insert_with(|| {
            debug!("stream {} opened by peer", stream_id);
            RecvStream::new(now)
        });
        stream.last_activity = now;

        match stream.fin_offset {
            Some(fin_offset) if end > fin_offset || (fin && end != fin_offset) => {
                return Err(ProtocolError::Malformed("data beyond final offset"));
            }
            None if fin && end < stream.next_offset => {
                return Err(ProtocolError::Malformed("final offset behind delivered data"));
            }
            _ => {}
        }

        let mut delivered = Vec::new();
        let outcome = if end <= stream.next_offset {
            if fin && stream.fin_offset.is_none() {
                DataOutcome::Accepted
            } else {
                DataOutcome::Duplicate
            }
        } else if offset <= stream.next_offset {
            let skip = (stream.next_offset - offset) as usize;
            delivered.push(payload.slice(skip..));
            stream.next_offset = end;
            stream.drain_pending(&mut delivered);
            DataOutcome::Accepted
        } else {
            let existing = stream.pending.get(&offset).map_or(0, Bytes::len);
            if existing >= payload.len() {
                DataOutcome::Duplicate
            } else if stream.pending_bytes - existing + payload.len() > limit {
                debug!(
                    "stream {} reorder buffer full ({} of {} bytes)",
                    stream_id, stream.pending_bytes, limit
                );
                return Ok(DataOutcome::Backpressure(ControlBody {
                    kind: ControlKind::Backpressure,
                    stream_id,
                    buffered: u32::try_from(stream.pending_bytes).unwrap_or(u32::MAX),
                    limit: u32::try_from(limit).unwrap_or(u32::MAX),
                }));
            } else {
                stream.pending_bytes = stream.pending_bytes - existing + payload.len();
                stream.pending.insert(offset, payload);
                DataOutcome::Accepted
            }
        };
        if fin {
            stream.fin_offset = Some(end);
        }
        let complete = stream.fin_offset == Some(stream.next_offset);

        let delivered_any = !delivered.is_empty();
        for data in delivered {
            self.ready.push_back(ReceivedData {
                stream_id,
                data,
                fin: false,
            });
        }
        if complete {
            match self.ready.back_mut() {
                Some(last) if delivered_any && last.stream_id == stream_id => last.fin = true,
                _ => self.ready.push_back(ReceivedData {
                    stream_id,
                    data: Bytes::new(),
                    fin: true,
                }),
            }
            self.recv.remove(&stream_id);
            self.finished.insert(stream_id, now);
            debug!("stream {} finished", stream_id);
        }
        Ok(outcome)
    }

    /// Peer abandoned a stream; buffered bytes are discarded.
    pub fn on_reset(&mut self, stream_id: u16, now: Instant) -> Result<bool, ProtocolError> {
        check_application_stream(stream_id)?;
        let existed = self.recv.remove(&stream_id).is_some();
        self.finished.insert(stream_id, now);
        if existed {
            debug!("stream {} reset by peer", stream_id);
        }
        Ok(existed)
    }

    /// Split outbound bytes into DATA frames of at most `max_frame_payload`.
    pub fn prepare_send(
        &mut self,
        stream_id: u16,
        data: Bytes,
        fin: bool,
        now: Instant,
    ) -> Result<Vec<Frame>, ProtocolError> {
        check_application_stream(stream_id)?;
        let max = self.config.max_frame_payload;
        let stream = self.send.entry(stream_id).or_insert_with(|| SendStream {
            next_offset: 0,
            fin_sent: false,
            last_activity: now,
        });
        if stream.fin_sent {
            return Err(ProtocolError::Malformed("send after FIN"));
        }
        end_offset(stream_id, stream.next_offset, data.len())?;

        let mut frames = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            let flags = if stream.next_offset == 0 {
                FrameFlags::SYN
            } else {
                FrameFlags::empty()
            };
            let len = chunk.len() as u64;
            frames.push(Frame::data(stream_id, stream.next_offset, chunk, flags));
            stream.next_offset += len;
        }
        if fin {
            match frames.last_mut() {
                Some(last) => last.flags |= FrameFlags::FIN,
                None => frames.push(Frame::data(
                    stream_id,
                    stream.next_offset,
                    Bytes::new(),
                    FrameFlags::FIN,
                )),
            }
            stream.fin_sent = true;
        }
        stream.last_activity = now;
        Ok(frames)
    }

    pub fn pop_ready(&mut self) -> Option<ReceivedData> {
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Streams with receive state (open and not yet finished).
    pub fn open_streams(&self) -> usize {
        self.recv.len()
    }

    pub fn buffered_bytes(&self, stream_id: u16) -> usize {
        self.recv.get(&stream_id).map_or(0, |s| s.pending_bytes)
    }

    /// Drop idle streams. Returns the receive streams that were closed.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<u16> {
        let idle = self.config.idle_timeout;
        let is_idle = |last: Instant| now.saturating_duration_since(last) >= idle;

        let expired: Vec<u16> = self
            .recv
            .iter()
            .filter(|(_, s)| s.pending.is_empty() && is_idle(s.last_activity))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.recv.remove(id);
            debug!("stream {} closed after idle timeout", id);
        }
        self.send.retain(|_, s| !is_idle(s.last_activity));
        self.finished.retain(|_, at| !is_idle(*at));
        expired
    }

    /// Earliest instant at which `expire_idle` could remove something.
    pub fn next_idle_deadline(&self) -> Option<Instant> {
        let idle = self.config.idle_timeout;
        self.recv
            .values()
            .filter(|s| s.pending.is_empty())
            .map(|s| s.last_activity)
            .chain(self.send.values().map(|s| s.last_activity))
            .chain(self.finished.values().copied())
            .min()
            .map(|t| t + idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux() -> StreamMultiplexer {
        StreamMultiplexer::new(StreamConfig {
            max_frame_payload: 4,
            max_reorder_bytes: 16,
            idle_timeout: Duration::from_secs(30),
        })
    }

    fn drain(m: &mut StreamMultiplexer) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(r) = m.pop_ready() {
            out.extend_from_slice(&r.data);
        }
        out
    }

    #[test]
    fn test_in_order_delivery() {
        let mut m = mux();
        let now = Instant::now();
        m.on_data(16, 0, Bytes::from_static(b"ab"), false, now).unwrap();
        m.on_data(16, 2, Bytes::from_static(b"cd"), false, now).unwrap();
        assert_eq!(drain(&mut m), b"abcd");
    }

    #[test]
    fn test_reorder() {
        let mut m = mux();
        let now = Instant::now();
        assert_eq!(
            m.on_data(20, 4, Bytes::from_static(b"efgh"), false, now).unwrap(),
            DataOutcome::Accepted
        );
        assert!(!m.has_ready());
        assert_eq!(m.buffered_bytes(20), 4);
        m.on_data(20, 0, Bytes::from_static(b"abcd"), false, now).unwrap();
        assert_eq!(drain(&mut m), b"abcdefgh");
        assert_eq!(m.buffered_bytes(20), 0);
    }

    #[test]
    fn test_duplicate_and_overlap_trimmed() {
        let mut m = mux();
        let now = Instant::now();
        m.on_data(16, 0, Bytes::from_static(b"abcd"), false, now).unwrap();
        assert_eq!(
            m.on_data(16, 0, Bytes::from_static(b"abcd"), false, now).unwrap(),
            DataOutcome::Duplicate
        );
        m.on_data(16, 2, Bytes::from_static(b"cdef"), false, now).unwrap();
        assert_eq!(drain(&mut m), b"abcdef");
    }

    #[test]
    fn test_reserved_streams() {
        let mut m = mux();
        let now = Instant::now();
        for id in 0..FIRST_APPLICATION_STREAM_ID {
            assert_eq!(
                m.on_data(id, 0, Bytes::from_static(b"x"), false, now),
                Err(ProtocolError::ReservedStream(id))
            );
            assert!(m.prepare_send(id, Bytes::from_static(b"x"), false, now).is_err());
        }
        assert!(!m.has_ready());
    }

    #[test]
    fn test_backpressure() {
        let mut m = mux();
        let now = Instant::now();
        m.on_data(16, 100, Bytes::from(vec![1u8; 10]), false, now).unwrap();
        let outcome = m
            .on_data(16, 200, Bytes::from(vec![2u8; 10]), false, now)
            .unwrap();
        assert_eq!(
            outcome,
            DataOutcome::Backpressure(ControlBody {
                kind: ControlKind::Backpressure,
                stream_id: 16,
                buffered: 10,
                limit: 16,
            })
        );
        assert_eq!(m.buffered_bytes(16), 10);
    }

    #[test]
    fn test_fin_closes_stream() {
        let mut m = mux();
        let now = Instant::now();
        m.on_data(16, 3, Bytes::from_static(b"def"), true, now).unwrap();
        assert_eq!(m.open_streams(), 1);
        m.on_data(16, 0, Bytes::from_static(b"abc"), false, now).unwrap();
        assert_eq!(m.open_streams(), 0);

        let first = m.pop_ready().unwrap();
        let second = m.pop_ready().unwrap();
        assert_eq!(first.data, Bytes::from_static(b"abc"));
        assert!(!first.fin);
        assert_eq!(second.data, Bytes::from_static(b"def"));
        assert!(second.fin);
        assert!(m.pop_ready().is_none());

        // Late retransmission after close.
        assert_eq!(
            m.on_data(16, 0, Bytes::from_static(b"abc"), false, now).unwrap(),
            DataOutcome::Duplicate
        );
        assert!(!m.has_ready());
    }

    #[test]
    fn test_empty_fin() {
        let mut m = mux();
        let now = Instant::now();
        m.on_data(16, 0, Bytes::from_static(b"ab"), false, now).unwrap();
        m.on_data(16, 2, Bytes::new(), true, now).unwrap();
        let data = m.pop_ready().unwrap();
        assert!(!data.fin);
        let end = m.pop_ready().unwrap();
        assert!(end.fin);
        assert!(end.data.is_empty());
    }

    #[test]
    fn test_data_beyond_fin_rejected() {
        let mut m = mux();
        let now = Instant::now();
        m.on_data(16, 4, Bytes::from_static(b"ef"), true, now).unwrap();
        assert!(matches!(
            m.on_data(16, 6, Bytes::from_static(b"g"), false, now),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_idle_expiry() {
        let mut m = mux();
        let now = Instant::now();
        m.on_data(16, 0, Bytes::from_static(b"ab"), false, now).unwrap();
        m.on_data(17, 8, Bytes::from_static(b"zz"), false, now).unwrap();

        assert!(m.expire_idle(now + Duration::from_secs(29)).is_empty());
        let expired = m.expire_idle(now + Duration::from_secs(30));
        // Stream 17 still has reordered bytes buffered.
        assert_eq!(expired, vec![16]);
        assert_eq!(m.open_streams(), 1);
    }

    #[test]
    fn test_prepare_send_chunks() {
        let mut m = mux();
        let now = Instant::now();
        let frames = m
            .prepare_send(16, Bytes::from_static(b"abcdefghij"), true, now)
            .unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].offset, 0);
        assert!(frames[0].flags.contains(FrameFlags::SYN));
        assert_eq!(frames[1].offset, 4);
        assert_eq!(frames[2].offset, 8);
        assert_eq!(frames[2].payload, Bytes::from_static(b"ij"));
        assert!(frames[2].is_fin());

        assert!(m
            .prepare_send(16, Bytes::from_static(b"more"), false, now)
            .is_err());
    }

    #[test]
    fn test_send_offset_overflow() {
        let mut m = mux();
        let now = Instant::now();
        m.prepare_send(16, Bytes::from_static(b"a"), false, now).unwrap();
        if let Some(s) = m.send.get_mut(&16) {
            s.next_offset = MAX_OFFSET;
        }
        assert!(m.prepare_send(16, Bytes::from_static(b"b"), false, now).is_ok());
        assert_eq!(
            m.prepare_send(16, Bytes::from_static(b"c"), false, now),
            Err(ProtocolError::OffsetOverflow {
                stream_id: 16,
                offset: MAX_OFFSET + 1
            })
        );
    }
}
