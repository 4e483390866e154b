//! Session state machine.
//!
//! A session owns one handshake, one pair of record halves and one stream
//! multiplexer. It never touches a socket: inbound datagrams are fed to
//! [`Session::handle_packet`], outbound ones are drained with
//! [`Session::poll_transmit`], and time only advances through the `now`
//! arguments.
//!
//! ```text
//!   Idle ──send/connect──► Handshaking ──msg2/msg3──► Established ◄──ack── Rekeying
//!                              │                          │  └──rekey due──►──┘
//!                        attempts spent               close / CLOSE
//!                              ▼                          ▼
//!                            Failed                    Closing ──ack/flush/grace──► Closed
//! ```
//!
//! Every piece of mutable state sits behind its own short-lived lock, so
//! `send` on one thread never waits for a decryption running on another.

use crate::config::SessionConfig;
use crate::error::{ProtocolError, SessionError, StateError};
use crate::frame::{
    close_code, AckBody, CloseBody, ControlBody, Frame, FrameError, FrameFlags, FrameType,
    RekeyBody, FIRST_APPLICATION_STREAM_ID, FRAME_HEADER_SIZE,
};
use crate::packet::{record_context, ConnectionId, HandshakeMessage, Packet, PACKET_HEADER_SIZE};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::stream::{DataOutcome, ReceivedData, StreamMultiplexer};
use bytes::{Bytes, BytesMut};
use shroud_crypto::identity::fingerprint;
use shroud_crypto::{
    record_pair, CryptoError, HandshakeError, HandshakeOutcome, HandshakeRole, Identity,
    Initiator, PeerId, RecordOpener, RecordSealer, RekeyApplied, Responder,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Handshaking,
    Established,
    /// Established with a DH ratchet step awaiting acknowledgement.
    Rekeying,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Records can be sealed and opened.
    pub fn has_keys(self) -> bool {
        matches!(
            self,
            SessionState::Established | SessionState::Rekeying | SessionState::Closing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Peer signals surfaced for a congestion controller or the application.
/// None of them are acted on by the session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Ack(AckBody),
    Control(ControlBody),
    Pong(Bytes),
    PeerClosed(CloseBody),
}

/// One datagram to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub payload: Bytes,
}

enum Attempt {
    Initiator(Initiator),
    Responder(Responder),
}

impl Attempt {
    fn abort(&mut self) {
        match self {
            Attempt::Initiator(i) => i.abort(),
            Attempt::Responder(r) => r.abort(),
        }
    }
}

#[derive(Default)]
struct HandshakeSlot {
    attempt: Option<Attempt>,
    attempts: u32,
    deadline: Option<Instant>,
    /// Start of the first attempt, for latency.
    started: Option<Instant>,
    /// Last handshake message sent, kept for retransmission.
    last_sent: Option<(HandshakeMessage, Bytes)>,
    /// Message 1 that produced the current attempt (responder).
    last_message_1: Option<Bytes>,
    /// When to resend message 3 if the responder has not spoken yet.
    retransmit_at: Option<Instant>,
}

#[derive(Default)]
struct Timers {
    rekey_sent_at: Option<Instant>,
    close_deadline: Option<Instant>,
    /// Peer initiated the close; finish once our reply is on the wire.
    close_after_flush: bool,
}

struct PeerInfo {
    peer_id: PeerId,
    fingerprint: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Session {
    connection_id: ConnectionId,
    role: HandshakeRole,
    identity: Arc<Identity>,
    pinned: Option<PeerId>,
    config: Arc<SessionConfig>,
    peer_addr: Mutex<SocketAddr>,
    state: Mutex<SessionState>,
    handshake: Mutex<HandshakeSlot>,
    sealer: Mutex<Option<RecordSealer>>,
    opener: Mutex<Option<RecordOpener>>,
    streams: Mutex<StreamMultiplexer>,
    /// Frames waiting to be sealed.
    queued: Mutex<Vec<Frame>>,
    datagrams: Mutex<VecDeque<Bytes>>,
    feedback: Mutex<VecDeque<Feedback>>,
    timers: Mutex<Timers>,
    peer: Mutex<Option<PeerInfo>>,
    next_frame_sequence: AtomicU64,
    stats: SessionStats,
}

impl Session {
    fn new(
        connection_id: ConnectionId,
        role: HandshakeRole,
        peer_addr: SocketAddr,
        identity: Arc<Identity>,
        pinned: Option<PeerId>,
        config: Arc<SessionConfig>,
    ) -> Self {
        let streams = StreamMultiplexer::new(config.stream_config());
        Self {
            connection_id,
            role,
            identity,
            pinned,
            config,
            peer_addr: Mutex::new(peer_addr),
            state: Mutex::new(SessionState::Idle),
            handshake: Mutex::new(HandshakeSlot::default()),
            sealer: Mutex::new(None),
            opener: Mutex::new(None),
            streams: Mutex::new(streams),
            queued: Mutex::new(Vec::new()),
            datagrams: Mutex::new(VecDeque::new()),
            feedback: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Timers::default()),
            peer: Mutex::new(None),
            next_frame_sequence: AtomicU64::new(0),
            stats: SessionStats::default(),
        }
    }

    /// Session that will dial `peer_addr`. `pinned` restricts the responder
    /// to one identity. `config` must already be validated.
    pub(crate) fn new_initiator(
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        identity: Arc<Identity>,
        pinned: Option<PeerId>,
        config: Arc<SessionConfig>,
    ) -> Result<Self, SessionError> {
        if let Some(peer) = &pinned {
            peer.to_public().map_err(CryptoError::from)?;
        }
        Ok(Self::new(
            connection_id,
            HandshakeRole::Initiator,
            peer_addr,
            identity,
            pinned,
            config,
        ))
    }

    /// Session answering a message 1 received from `peer_addr`. `config`
    /// must already be validated.
    pub(crate) fn new_responder(
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        identity: Arc<Identity>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self::new(
            connection_id,
            HandshakeRole::Responder,
            peer_addr,
            identity,
            None,
            config,
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        *lock(&self.peer_addr)
    }

    /// Authenticated peer identity, once established.
    pub fn peer_id(&self) -> Option<PeerId> {
        lock(&self.peer).as_ref().map(|p| p.peer_id.clone())
    }

    /// Handshake fingerprint for out-of-band comparison.
    pub fn fingerprint(&self) -> Option<String> {
        lock(&self.peer).as_ref().map(|p| p.fingerprint.clone())
    }

    /// Sending and receiving epochs.
    pub fn epochs(&self) -> Option<(u32, u32)> {
        let send = lock(&self.sealer).as_ref().map(RecordSealer::epoch)?;
        let recv = lock(&self.opener).as_ref().map(RecordOpener::epoch)?;
        Some((send, recv))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Responder that answered message 1 and still waits for message 3.
    pub fn is_half_open(&self) -> bool {
        self.role == HandshakeRole::Responder && self.state() == SessionState::Handshaking
    }

    /// No delivered data or peer feedback left for the application.
    pub fn is_drained(&self) -> bool {
        lock(&self.feedback).is_empty() && !lock(&self.streams).has_ready()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("session {} {:?} -> {:?}", self.connection_id, *state, next);
            *state = next;
        }
    }

    /// Move to `next` only from one of `from`.
    fn transition(&self, from: &[SessionState], next: SessionState) -> bool {
        let mut state = lock(&self.state);
        if !from.contains(&state) {
            return false;
        }
        debug!("session {} {:?} -> {:?}", self.connection_id, *state, next);
        *state = next;
        true
    }

    fn wipe(&self) {
        *lock(&self.sealer) = None;
        *lock(&self.opener) = None;
        let mut slot = lock(&self.handshake);
        if let Some(attempt) = slot.attempt.as_mut() {
            attempt.abort();
        }
        slot.attempt = None;
        slot.last_sent = None;
        slot.retransmit_at = None;
        drop(slot);
        lock(&self.queued).clear();
    }

    fn fail(&self, reason: &str) {
        warn!("session {} failed: {}", self.connection_id, reason);
        self.set_state(SessionState::Failed);
        self.wipe();
    }

    fn finish_close(&self) {
        if self.transition(&[SessionState::Closing], SessionState::Closed) {
            info!("session {} closed", self.connection_id);
            self.wipe();
        }
    }

    fn enqueue(&self, frame: Frame) {
        lock(&self.queued).push(frame);
    }

    fn push_handshake(&self, message: HandshakeMessage, body: Bytes) {
        let datagram = Packet::handshake(self.connection_id, message, body).encode();
        self.stats.handshake_sent(datagram.len());
        lock(&self.datagrams).push_back(datagram);
    }

    /// Start the handshake now instead of on the first `send`.
    pub fn connect(&self, now: Instant) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_terminal() || state == SessionState::Closing {
            return Err(StateError::Inactive(state).into());
        }
        if self.role != HandshakeRole::Initiator
            || !self.transition(&[SessionState::Idle], SessionState::Handshaking)
        {
            return Ok(());
        }
        let mut slot = lock(&self.handshake);
        self.start_attempt(&mut slot, now)
    }

    fn start_attempt(&self, slot: &mut HandshakeSlot, now: Instant) -> Result<(), SessionError> {
        let pinned = match &self.pinned {
            Some(peer) => Some(peer.to_public().map_err(CryptoError::from)?),
            None => None,
        };
        let deadline = now + self.config.handshake_timeout();
        let mut initiator = Initiator::new(self.identity.clone(), pinned, deadline);
        let message = Bytes::from(initiator.write_message_1(now)?);

        slot.attempts += 1;
        slot.started.get_or_insert(now);
        slot.deadline = Some(deadline);
        slot.attempt = Some(Attempt::Initiator(initiator));
        slot.last_sent = Some((HandshakeMessage::First, message.clone()));
        self.stats.handshake_attempt();
        debug!(
            "session {} handshake attempt {} started",
            self.connection_id, slot.attempts
        );
        self.push_handshake(HandshakeMessage::First, message);
        Ok(())
    }

    /// Queue bytes on a stream. Before establishment they wait for the
    /// handshake, which the first send starts.
    pub fn send(
        &self,
        stream_id: u16,
        data: Bytes,
        fin: bool,
        now: Instant,
    ) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_terminal() || state == SessionState::Closing {
            return Err(StateError::Inactive(state).into());
        }

        let frames = lock(&self.streams).prepare_send(stream_id, data, fin, now)?;
        lock(&self.queued).extend(frames);

        if state == SessionState::Idle {
            self.connect(now)?;
        }
        self.flush(now)
    }

    /// Begin an orderly close. Queued data is flushed ahead of the CLOSE.
    pub fn close(&self, now: Instant) -> Result<(), SessionError> {
        let state = self.state();
        match state {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => {
                Err(StateError::Inactive(state).into())
            }
            SessionState::Idle | SessionState::Handshaking => {
                self.set_state(SessionState::Closed);
                self.wipe();
                info!("session {} closed before establishment", self.connection_id);
                Ok(())
            }
            SessionState::Established | SessionState::Rekeying => {
                self.enqueue(Frame::close(&CloseBody {
                    code: close_code::NORMAL,
                    reason: String::new(),
                }));
                self.flush(now)?;
                if self.transition(
                    &[SessionState::Established, SessionState::Rekeying],
                    SessionState::Closing,
                ) {
                    lock(&self.timers).close_deadline = Some(now + self.config.close_grace());
                    info!("session {} closing", self.connection_id);
                }
                Ok(())
            }
        }
    }

    /// Next in-order chunk delivered by any stream.
    pub fn poll_received(&self) -> Option<ReceivedData> {
        lock(&self.streams).pop_ready()
    }

    pub fn poll_feedback(&self) -> Option<Feedback> {
        lock(&self.feedback).pop_front()
    }

    pub fn poll_transmit(&self) -> Option<Transmit> {
        let (payload, drained) = {
            let mut datagrams = lock(&self.datagrams);
            let payload = datagrams.pop_front()?;
            (payload, datagrams.is_empty())
        };
        if drained && lock(&self.timers).close_after_flush {
            self.finish_close();
        }
        Some(Transmit {
            destination: self.peer_addr(),
            payload,
        })
    }

    /// Feed one decoded datagram addressed to this session.
    pub fn handle_packet(
        &self,
        packet: Packet,
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(StateError::Inactive(state).into());
        }
        self.stats
            .datagram_received(PACKET_HEADER_SIZE + packet.body.len());

        if let Some(message) = packet.handshake_message()? {
            return self.handle_handshake(message, packet.body, now);
        }
        if !state.has_keys() {
            return Err(StateError::NotEstablished.into());
        }

        let opened = {
            let mut opener = lock(&self.opener);
            let opener = opener.as_mut().ok_or(StateError::NotEstablished)?;
            opener.open(
                record_context(&self.connection_id),
                packet.epoch,
                packet.sequence,
                &packet.body,
            )
        };
        let record = match opened {
            Ok(record) => record,
            Err(e) => {
                match &e {
                    CryptoError::Replay { .. } => self.stats.replay(),
                    CryptoError::AuthenticationFailed => self.stats.auth_failure(),
                    _ => self.stats.undecryptable(),
                }
                debug!(
                    "session {} dropped record {}:{}: {}",
                    self.connection_id, packet.epoch, packet.sequence, e
                );
                return Err(e.into());
            }
        };
        trace!(
            "session {} record {}:{} opened",
            self.connection_id,
            record.epoch,
            record.sequence
        );
        self.on_authenticated(from);

        let frames = match Frame::decode_all(Bytes::from(record.plaintext)) {
            Ok(frames) => frames,
            Err(e) => {
                let err = self.violation(e.into(), now);
                self.flush(now)?;
                return Err(err);
            }
        };
        self.stats.record_received(frames.len());

        let mut last_violation = None;
        for frame in frames {
            match self.handle_frame(frame, now) {
                Ok(()) => {}
                Err(SessionError::Protocol(e)) => {
                    last_violation = Some(self.violation(e, now));
                    if self.state().is_terminal() {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.flush(now)?;
        match last_violation {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn on_authenticated(&self, from: SocketAddr) {
        {
            let mut addr = lock(&self.peer_addr);
            if *addr != from {
                info!(
                    "session {} peer moved {} -> {}",
                    self.connection_id, *addr, from
                );
                *addr = from;
            }
        }
        if self.role == HandshakeRole::Initiator {
            let mut slot = lock(&self.handshake);
            slot.last_sent = None;
            slot.retransmit_at = None;
        }
    }

    fn violation(&self, err: ProtocolError, now: Instant) -> SessionError {
        let count = self.stats.protocol_violation();
        warn!("session {} protocol violation: {}", self.connection_id, err);
        if count > u64::from(self.config.protocol_violation_threshold) {
            self.enqueue(Frame::close(&CloseBody {
                code: close_code::PROTOCOL_VIOLATION,
                reason: "too many protocol violations".into(),
            }));
            if let Err(e) = self.flush(now) {
                debug!("session {} could not send close: {}", self.connection_id, e);
            }
            self.fail("protocol violation threshold exceeded");
        }
        SessionError::Protocol(err)
    }

    fn handle_handshake(
        &self,
        message: HandshakeMessage,
        body: Bytes,
        now: Instant,
    ) -> Result<(), SessionError> {
        let mut slot = lock(&self.handshake);
        match (self.role, message) {
            (HandshakeRole::Responder, HandshakeMessage::First) => {
                if self.state().has_keys() {
                    trace!("session {} ignoring stale message 1", self.connection_id);
                    return Ok(());
                }
                if slot.last_message_1.as_ref() == Some(&body) {
                    if let Some((HandshakeMessage::Second, reply)) = slot.last_sent.clone() {
                        debug!("session {} resending message 2", self.connection_id);
                        drop(slot);
                        self.push_handshake(HandshakeMessage::Second, reply);
                        return Ok(());
                    }
                }

                let deadline = now + self.config.handshake_timeout();
                let mut responder = Responder::new(self.identity.clone(), None, deadline);
                let reply = Bytes::from(responder.respond(&body, now)?);
                if let Some(previous) = slot.attempt.as_mut() {
                    previous.abort();
                }
                slot.attempts += 1;
                slot.started.get_or_insert(now);
                slot.deadline = Some(deadline);
                slot.attempt = Some(Attempt::Responder(responder));
                slot.last_message_1 = Some(body);
                slot.last_sent = Some((HandshakeMessage::Second, reply.clone()));
                drop(slot);

                self.stats.handshake_attempt();
                self.transition(&[SessionState::Idle], SessionState::Handshaking);
                self.push_handshake(HandshakeMessage::Second, reply);
                Ok(())
            }
            (HandshakeRole::Initiator, HandshakeMessage::Second) => {
                let mut initiator = match slot.attempt.take() {
                    Some(Attempt::Initiator(initiator)) => initiator,
                    other => {
                        slot.attempt = other;
                        // Message 2 retransmitted because our message 3 was lost.
                        if let Some((HandshakeMessage::Third, reply)) = slot.last_sent.clone() {
                            drop(slot);
                            self.push_handshake(HandshakeMessage::Third, reply);
                            return Ok(());
                        }
                        return Err(HandshakeError::InvalidState("unexpected message 2").into());
                    }
                };
                initiator.read_message_2(&body, now)?;
                let reply = Bytes::from(initiator.write_message_3(now)?);
                let outcome = initiator.finish()?;

                let latency = slot.started.map(|t| now.saturating_duration_since(t));
                slot.deadline = None;
                slot.last_sent = Some((HandshakeMessage::Third, reply.clone()));
                slot.retransmit_at = Some(now + self.retransmit_interval());
                drop(slot);

                self.push_handshake(HandshakeMessage::Third, reply);
                self.establish(outcome, latency, now)
            }
            (HandshakeRole::Responder, HandshakeMessage::Third) => {
                let mut responder = match slot.attempt.take() {
                    Some(Attempt::Responder(responder)) => responder,
                    other => {
                        slot.attempt = other;
                        if self.state().has_keys() {
                            return Ok(());
                        }
                        return Err(HandshakeError::InvalidState("unexpected message 3").into());
                    }
                };
                responder.read_message_3(&body, now)?;
                let outcome = responder.finish()?;

                let latency = slot.started.map(|t| now.saturating_duration_since(t));
                slot.deadline = None;
                slot.last_sent = None;
                drop(slot);

                self.establish(outcome, latency, now)
            }
            _ => Err(HandshakeError::InvalidState("unexpected handshake message").into()),
        }
    }

    fn establish(
        &self,
        outcome: HandshakeOutcome,
        latency: Option<Duration>,
        now: Instant,
    ) -> Result<(), SessionError> {
        let peer_id = PeerId::from_public(outcome.remote_static());
        let print = fingerprint(outcome.transcript_hash());
        let (sealer, opener) = record_pair(
            outcome,
            &self.config.ratchet_config(),
            self.config.replay_window,
            now,
        )?;

        *lock(&self.sealer) = Some(sealer);
        *lock(&self.opener) = Some(opener);
        *lock(&self.peer) = Some(PeerInfo {
            peer_id: peer_id.clone(),
            fingerprint: print,
        });
        if !self.transition(
            &[SessionState::Idle, SessionState::Handshaking],
            SessionState::Established,
        ) {
            // Closed while the last message was in flight.
            self.wipe();
            return Ok(());
        }

        let latency = latency.unwrap_or_default();
        self.stats.set_handshake_latency(latency);
        info!(
            "session {} established with {} in {:?}",
            self.connection_id, peer_id, latency
        );
        self.flush(now)
    }

    fn handle_frame(&self, frame: Frame, now: Instant) -> Result<(), SessionError> {
        match frame.frame_type {
            FrameType::Data => {
                let max = self.config.max_frame_payload;
                if frame.payload.len() > max {
                    return Err(ProtocolError::PayloadTooLarge {
                        len: frame.payload.len(),
                        max,
                    }
                    .into());
                }
                let sequence = frame.sequence;
                let fin = frame.is_fin();
                let outcome = lock(&self.streams).on_data(
                    frame.stream_id,
                    frame.offset,
                    frame.payload,
                    fin,
                    now,
                );
                match outcome {
                    Ok(DataOutcome::Accepted) => {}
                    Ok(DataOutcome::Duplicate) => self.stats.duplicate_frame(),
                    Ok(DataOutcome::Backpressure(body)) => {
                        self.stats.backpressure();
                        self.enqueue(Frame::control(body));
                    }
                    Err(ProtocolError::ReservedStream(id)) => {
                        self.stats.reserved_stream_drop();
                        return Err(ProtocolError::ReservedStream(id).into());
                    }
                    Err(e) => return Err(e.into()),
                }
                self.enqueue(Frame::ack(AckBody {
                    largest: sequence,
                    delay_micros: 0,
                }));
            }
            FrameType::Ack => {
                let body = AckBody::decode(&frame.payload)?;
                lock(&self.feedback).push_back(Feedback::Ack(body));
            }
            FrameType::Control => {
                let body = ControlBody::decode(&frame.payload)?;
                lock(&self.feedback).push_back(Feedback::Control(body));
            }
            FrameType::Rekey if frame.flags.contains(FrameFlags::ACK) => {
                let epoch = RekeyBody::decode_ack(&frame.payload)?;
                let committed = {
                    let mut sealer = lock(&self.sealer);
                    let sealer = sealer.as_mut().ok_or(StateError::NotEstablished)?;
                    let committed = sealer.commit_rekey(epoch, now);
                    if committed == Ok(true) {
                        lock(&self.timers).rekey_sent_at = None;
                        self.transition(&[SessionState::Rekeying], SessionState::Established);
                    }
                    committed
                };
                match committed {
                    Ok(true) => {
                        self.stats.rekey();
                        info!(
                            "session {} rekeyed: sending epoch {}",
                            self.connection_id, epoch
                        );
                    }
                    Ok(false) => trace!("session {} repeated rekey ack", self.connection_id),
                    Err(_) => return Err(ProtocolError::Malformed("rekey ack").into()),
                }
            }
            FrameType::Rekey => {
                let body = RekeyBody::decode(&frame.payload)?;
                let applied = {
                    let mut opener = lock(&self.opener);
                    let opener = opener.as_mut().ok_or(StateError::NotEstablished)?;
                    opener.apply_rekey(&body.into())
                };
                match applied {
                    Ok(RekeyApplied::Applied) => debug!(
                        "session {} peer rekeyed to epoch {}",
                        self.connection_id, body.new_epoch
                    ),
                    Ok(RekeyApplied::Duplicate) => {}
                    Err(_) => return Err(ProtocolError::Malformed("rekey proposal").into()),
                }
                self.enqueue(Frame::rekey_ack(body.new_epoch));
            }
            FrameType::Ping => self.enqueue(Frame::pong(frame.payload)),
            FrameType::Pong => lock(&self.feedback).push_back(Feedback::Pong(frame.payload)),
            FrameType::Close if frame.flags.contains(FrameFlags::ACK) => self.finish_close(),
            FrameType::Close => {
                let body = CloseBody::decode(&frame.payload)?;
                info!(
                    "session {} closed by peer (code {}): {}",
                    self.connection_id, body.code, body.reason
                );
                lock(&self.feedback).push_back(Feedback::PeerClosed(body));
                self.enqueue(Frame::close_ack());
                let started_closing = self.transition(
                    &[SessionState::Established, SessionState::Rekeying],
                    SessionState::Closing,
                );
                if started_closing {
                    let mut timers = lock(&self.timers);
                    timers.close_after_flush = true;
                    timers.close_deadline = Some(now + self.config.close_grace());
                }
            }
            FrameType::Pad => {}
            FrameType::StreamOpen => {
                if frame.stream_id < FIRST_APPLICATION_STREAM_ID {
                    return Err(ProtocolError::ReservedStream(frame.stream_id).into());
                }
            }
            FrameType::StreamClose => {
                let outcome =
                    lock(&self.streams).on_data(frame.stream_id, frame.offset, Bytes::new(), true, now)?;
                if outcome == DataOutcome::Duplicate {
                    self.stats.duplicate_frame();
                }
            }
            FrameType::StreamReset => {
                lock(&self.streams).on_reset(frame.stream_id, now)?;
            }
        }
        Ok(())
    }

    /// Start a DH ratchet step if the schedule fired.
    fn maybe_rekey(&self, now: Instant) -> Result<(), SessionError> {
        if self.state() != SessionState::Established {
            return Ok(());
        }
        // Proposal and state change happen under the sealer lock so a
        // concurrent ack cannot commit in between.
        let proposal = {
            let mut sealer = lock(&self.sealer);
            let proposal = match sealer.as_mut() {
                Some(sealer) if sealer.rekey_due(now) => sealer.begin_rekey()?,
                _ => return Ok(()),
            };
            if !self.transition(&[SessionState::Established], SessionState::Rekeying) {
                return Ok(());
            }
            lock(&self.timers).rekey_sent_at = Some(now);
            proposal
        };
        info!(
            "session {} rekey proposed: epoch {}",
            self.connection_id, proposal.new_epoch
        );
        self.enqueue(Frame::rekey(&proposal));
        Ok(())
    }

    /// Seal every queued frame into datagrams.
    fn flush(&self, now: Instant) -> Result<(), SessionError> {
        if !self.state().has_keys() {
            return Ok(());
        }
        if let Err(e) = self.maybe_rekey(now) {
            self.fail("rekey failed");
            return Err(e);
        }
        let frames = std::mem::take(&mut *lock(&self.queued));
        if frames.is_empty() {
            return Ok(());
        }
        let records = self.build_records(frames)?;

        let context = record_context(&self.connection_id);
        let sealed: Result<(), CryptoError> = {
            let mut sealer = lock(&self.sealer);
            let Some(sealer) = sealer.as_mut() else {
                return Ok(());
            };
            records
                .iter()
                .map(|(plaintext, count)| {
                    let record = sealer.seal(context, plaintext)?;
                    let datagram = Packet {
                        connection_id: self.connection_id,
                        epoch: record.epoch,
                        sequence: record.sequence,
                        body: Bytes::from(record.ciphertext),
                    }
                    .encode();
                    self.stats.record_sent(*count, datagram.len());
                    Ok(datagram)
                })
                .collect::<Result<Vec<Bytes>, CryptoError>>()
                // Queued under the sealer lock so concurrent flushes leave in
                // sequence order.
                .map(|datagrams| lock(&self.datagrams).extend(datagrams))
        };
        if let Err(e) = sealed {
            self.fail("sealing failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Coalesce frames into record plaintexts no larger than one full DATA
    /// frame, each padded to the configured bucket.
    fn build_records(&self, frames: Vec<Frame>) -> Result<Vec<(BytesMut, usize)>, FrameError> {
        let budget = self.config.max_frame_payload + FRAME_HEADER_SIZE;
        let mut records = Vec::new();
        let mut current = BytesMut::new();
        let mut count = 0;
        for mut frame in frames {
            frame.sequence = self.next_frame_sequence.fetch_add(1, Ordering::Relaxed);
            if count > 0 && current.len() + frame.encoded_len() > budget {
                records.push((self.pad(std::mem::take(&mut current))?, count));
                count = 0;
            }
            frame.encode(&mut current)?;
            count += 1;
        }
        if count > 0 {
            records.push((self.pad(current)?, count));
        }
        Ok(records)
    }

    fn pad(&self, mut record: BytesMut) -> Result<BytesMut, FrameError> {
        let Some(bucket) = self.config.pad_to else {
            return Ok(record);
        };
        let remainder = record.len() % bucket;
        if remainder != 0 {
            let mut fill = bucket - remainder;
            if fill < FRAME_HEADER_SIZE {
                fill += bucket;
            }
            let padding = u16::try_from(fill - FRAME_HEADER_SIZE)
                .map_err(|_| FrameError::PayloadTooLarge(fill))?;
            Frame::pad(padding).encode(&mut record)?;
        }
        Ok(record)
    }

    /// Drive timers: handshake retries, rekeys, close grace, stream expiry.
    pub fn handle_timeout(&self, now: Instant) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Handshaking => self.handshake_timeout(now)?,
            SessionState::Established | SessionState::Rekeying => {
                self.retransmit_message_3(now);
                self.retransmit_rekey(now);
            }
            SessionState::Closing => {
                let deadline = lock(&self.timers).close_deadline;
                if deadline.is_some_and(|d| now >= d) {
                    debug!("session {} close grace elapsed", self.connection_id);
                    self.finish_close();
                }
            }
            _ => {}
        }
        lock(&self.streams).expire_idle(now);
        self.flush(now)
    }

    fn handshake_timeout(&self, now: Instant) -> Result<(), SessionError> {
        let mut slot = lock(&self.handshake);
        match slot.deadline {
            Some(deadline) if now > deadline => {}
            _ => return Ok(()),
        }
        if let Some(attempt) = slot.attempt.as_mut() {
            attempt.abort();
        }
        slot.attempt = None;

        if self.role == HandshakeRole::Initiator && slot.attempts < self.config.handshake_attempts
        {
            debug!(
                "session {} handshake attempt {} timed out, retrying",
                self.connection_id, slot.attempts
            );
            return self.start_attempt(&mut slot, now);
        }
        let attempts = slot.attempts;
        drop(slot);
        self.fail(&format!("handshake timed out after {} attempts", attempts));
        Err(HandshakeError::Timeout.into())
    }

    /// Message 3 resend interval; shorter than the responder's deadline.
    fn retransmit_interval(&self) -> Duration {
        self.config.handshake_timeout() / 2
    }

    fn retransmit_message_3(&self, now: Instant) {
        let mut slot = lock(&self.handshake);
        let due = slot.retransmit_at.is_some_and(|t| now >= t);
        if let (true, Some((HandshakeMessage::Third, reply))) = (due, slot.last_sent.clone()) {
            slot.retransmit_at = Some(now + self.retransmit_interval());
            drop(slot);
            debug!("session {} resending message 3", self.connection_id);
            self.push_handshake(HandshakeMessage::Third, reply);
        }
    }

    fn retransmit_rekey(&self, now: Instant) {
        if self.state() != SessionState::Rekeying {
            return;
        }
        let interval = self.config.handshake_timeout();
        {
            let mut timers = lock(&self.timers);
            match timers.rekey_sent_at {
                Some(sent) if now.saturating_duration_since(sent) >= interval => {
                    timers.rekey_sent_at = Some(now);
                }
                _ => return,
            }
        }
        let pending = lock(&self.sealer).as_ref().and_then(RecordSealer::pending_rekey);
        if let Some(proposal) = pending {
            debug!(
                "session {} resending rekey for epoch {}",
                self.connection_id, proposal.new_epoch
            );
            self.enqueue(Frame::rekey(&proposal));
        }
    }

    /// Earliest instant at which `handle_timeout` has work to do.
    pub fn next_timeout(&self) -> Option<Instant> {
        let state = self.state();
        let mut deadlines = Vec::new();
        match state {
            SessionState::Handshaking => {
                let slot = lock(&self.handshake);
                // Attempts expire strictly after their deadline.
                deadlines.extend(slot.deadline.map(|d| d + Duration::from_millis(1)));
            }
            SessionState::Established | SessionState::Rekeying => {
                deadlines.extend(lock(&self.handshake).retransmit_at);
                deadlines.extend(
                    lock(&self.sealer)
                        .as_ref()
                        .map(RecordSealer::next_rekey_deadline),
                );
                if state == SessionState::Rekeying {
                    let interval = self.config.handshake_timeout();
                    deadlines.extend(lock(&self.timers).rekey_sent_at.map(|t| t + interval));
                }
            }
            SessionState::Closing => deadlines.extend(lock(&self.timers).close_deadline),
            _ => return None,
        }
        deadlines.extend(lock(&self.streams).next_idle_deadline());
        deadlines.into_iter().min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pair(config: SessionConfig) -> (Session, Session) {
        let config = Arc::new(config);
        let cid = ConnectionId::random();
        let initiator = Session::new_initiator(
            cid,
            addr(2),
            Arc::new(Identity::generate()),
            None,
            config.clone(),
        )
        .unwrap();
        let responder = Session::new_responder(cid, addr(1), Arc::new(Identity::generate()), config);
        (initiator, responder)
    }

    /// Deliver datagrams both ways until both queues are empty.
    fn pump(a: &Session, b: &Session, now: Instant) {
        loop {
            let mut moved = false;
            while let Some(t) = a.poll_transmit() {
                let _ = b.handle_packet(Packet::decode(t.payload).unwrap(), addr(1), now);
                moved = true;
            }
            while let Some(t) = b.poll_transmit() {
                let _ = a.handle_packet(Packet::decode(t.payload).unwrap(), addr(2), now);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    fn received(session: &Session) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(r) = session.poll_received() {
            out.extend_from_slice(&r.data);
        }
        out
    }

    fn established(config: SessionConfig) -> (Session, Session, Instant) {
        let (a, b) = pair(config);
        let now = Instant::now();
        a.connect(now).unwrap();
        pump(&a, &b, now);
        assert_eq!(a.state(), SessionState::Established);
        assert_eq!(b.state(), SessionState::Established);
        (a, b, now)
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let (a, b, _) = established(SessionConfig::default());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().is_some());
        assert!(a.stats().handshake_latency_us.is_some());
        assert_eq!(a.stats().handshake_attempts, 1);
        assert_eq!(a.epochs(), Some((0, 0)));
    }

    #[test]
    fn test_data_sent_before_establishment_is_delivered() {
        let (a, b) = pair(SessionConfig::default());
        let now = Instant::now();
        a.send(16, Bytes::from_static(b"early"), false, now).unwrap();
        assert_eq!(a.state(), SessionState::Handshaking);
        pump(&a, &b, now);
        assert_eq!(received(&b), b"early");
    }

    #[test]
    fn test_large_send_is_chunked_and_acked() {
        let (a, b, now) = established(SessionConfig::default());
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        a.send(16, Bytes::from(data.clone()), true, now).unwrap();
        pump(&a, &b, now);
        assert_eq!(received(&b), data);

        let mut acks = 0;
        while let Some(feedback) = a.poll_feedback() {
            if matches!(feedback, Feedback::Ack(_)) {
                acks += 1;
            }
        }
        assert_eq!(acks, 5);
    }

    #[test]
    fn test_ping_pong() {
        let (a, b, now) = established(SessionConfig::default());
        a.enqueue(Frame::ping(Bytes::from_static(b"rtt")));
        a.flush(now).unwrap();
        pump(&a, &b, now);
        assert_eq!(
            a.poll_feedback(),
            Some(Feedback::Pong(Bytes::from_static(b"rtt")))
        );
    }

    #[test]
    fn test_close_handshake() {
        let (a, b, now) = established(SessionConfig::default());
        a.close(now).unwrap();
        assert_eq!(a.state(), SessionState::Closing);
        assert!(matches!(
            a.send(16, Bytes::from_static(b"x"), false, now),
            Err(SessionError::State(StateError::Inactive(SessionState::Closing)))
        ));

        pump(&a, &b, now);
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
        assert!(matches!(b.poll_feedback(), Some(Feedback::PeerClosed(_))));
        assert_eq!(
            a.close(now),
            Err(SessionError::State(StateError::Inactive(SessionState::Closed)))
        );
    }

    #[test]
    fn test_close_grace_elapses() {
        let (a, _b, now) = established(SessionConfig::default());
        a.close(now).unwrap();
        while a.poll_transmit().is_some() {}
        a.handle_timeout(now + Duration::from_millis(2_999)).unwrap();
        assert_eq!(a.state(), SessionState::Closing);
        a.handle_timeout(now + Duration::from_millis(3_000)).unwrap();
        assert_eq!(a.state(), SessionState::Closed);
    }

    #[test]
    fn test_reserved_stream_threshold() {
        let config = SessionConfig {
            protocol_violation_threshold: 2,
            ..Default::default()
        };
        let (a, b, now) = established(config);
        for id in [3u16, 7, 15] {
            a.enqueue(Frame::data(id, 0, Bytes::from_static(b"x"), FrameFlags::empty()));
            a.flush(now).unwrap();
        }
        pump(&a, &b, now);

        let stats = b.stats();
        assert_eq!(stats.reserved_stream_drops, 3);
        assert_eq!(stats.protocol_violations, 3);
        assert_eq!(b.state(), SessionState::Failed);
        assert!(b.poll_received().is_none());
        assert_eq!(
            b.send(16, Bytes::from_static(b"x"), false, now),
            Err(SessionError::State(StateError::Inactive(SessionState::Failed)))
        );
    }

    #[test]
    fn test_single_violation_is_not_fatal() {
        let (a, b, now) = established(SessionConfig::default());
        a.enqueue(Frame::data(0, 0, Bytes::from_static(b"x"), FrameFlags::empty()));
        a.flush(now).unwrap();
        let t = a.poll_transmit().unwrap();
        let err = b
            .handle_packet(Packet::decode(t.payload).unwrap(), addr(1), now)
            .unwrap_err();
        assert_eq!(err, SessionError::Protocol(ProtocolError::ReservedStream(0)));
        assert!(!err.is_fatal());
        assert_eq!(b.state(), SessionState::Established);
    }

    #[test]
    fn test_handshake_retry_then_fail() {
        let (a, _b) = pair(SessionConfig::default());
        let start = Instant::now();
        a.connect(start).unwrap();
        let first = a.poll_transmit().unwrap().payload;

        let timeout = Duration::from_millis(5_000);
        a.handle_timeout(start + timeout).unwrap();
        assert!(a.poll_transmit().is_none());

        let mut now = start + timeout + Duration::from_millis(1);
        a.handle_timeout(now).unwrap();
        let second = a.poll_transmit().unwrap().payload;
        assert_ne!(first, second, "retry must use a fresh ephemeral");

        now += timeout + Duration::from_millis(1);
        a.handle_timeout(now).unwrap();
        assert!(a.poll_transmit().is_some());
        assert_eq!(a.stats().handshake_attempts, 3);

        now += timeout + Duration::from_millis(1);
        assert_eq!(
            a.handle_timeout(now),
            Err(SessionError::Handshake(HandshakeError::Timeout))
        );
        assert_eq!(a.state(), SessionState::Failed);
    }

    #[test]
    fn test_lost_message_3_is_resent() {
        let (a, b) = pair(SessionConfig::default());
        let now = Instant::now();
        a.connect(now).unwrap();
        let m1 = a.poll_transmit().unwrap();
        b.handle_packet(Packet::decode(m1.payload).unwrap(), addr(1), now)
            .unwrap();
        let m2 = b.poll_transmit().unwrap();
        a.handle_packet(Packet::decode(m2.payload).unwrap(), addr(2), now)
            .unwrap();
        // Drop message 3.
        assert!(a.poll_transmit().is_some());
        assert_eq!(b.state(), SessionState::Handshaking);

        let later = now + Duration::from_secs(3);
        a.handle_timeout(later).unwrap();
        pump(&a, &b, later);
        assert_eq!(b.state(), SessionState::Established);
    }

    #[test]
    fn test_rekey_on_message_limit() {
        let config = SessionConfig {
            rekey_message_limit: 4,
            ..Default::default()
        };
        let (a, b, now) = established(config);
        for i in 0..20u8 {
            a.send(16, Bytes::from(vec![i; 10]), false, now).unwrap();
            pump(&a, &b, now);
        }
        assert_eq!(received(&b).len(), 200);
        assert!(a.stats().rekeys >= 1);
        let (a_send, a_recv) = a.epochs().unwrap();
        let (b_send, b_recv) = b.epochs().unwrap();
        assert!(a_send >= 1);
        assert_eq!(a_send, b_recv);
        assert_eq!(b_send, a_recv);
    }

    #[test]
    fn test_duplicate_datagram_counted_as_replay() {
        let (a, b, now) = established(SessionConfig::default());
        a.send(16, Bytes::from_static(b"once"), false, now).unwrap();
        let t = a.poll_transmit().unwrap();
        let packet = Packet::decode(t.payload).unwrap();
        b.handle_packet(packet.clone(), addr(1), now).unwrap();
        assert!(matches!(
            b.handle_packet(packet, addr(1), now),
            Err(SessionError::Crypto(CryptoError::Replay { .. }))
        ));
        assert_eq!(received(&b), b"once");
        assert_eq!(b.stats().replay_rejections, 1);
    }

    #[test]
    fn test_padding_buckets() {
        let config = SessionConfig {
            pad_to: Some(256),
            ..Default::default()
        };
        let (a, b, now) = established(config);
        a.send(16, Bytes::from_static(b"short"), false, now).unwrap();
        let t = a.poll_transmit().unwrap();
        let body_len = t.payload.len() - PACKET_HEADER_SIZE - shroud_crypto::record::TAG_LEN;
        assert_eq!(body_len % 256, 0);
        b.handle_packet(Packet::decode(t.payload).unwrap(), addr(1), now)
            .unwrap();
        assert_eq!(received(&b), b"short");
    }

    #[test]
    fn test_peer_address_follows_authenticated_records() {
        let (a, b, now) = established(SessionConfig::default());
        a.send(16, Bytes::from_static(b"moved"), false, now).unwrap();
        let t = a.poll_transmit().unwrap();
        b.handle_packet(Packet::decode(t.payload).unwrap(), addr(9), now)
            .unwrap();
        assert_eq!(b.peer_addr(), addr(9));
    }
}
