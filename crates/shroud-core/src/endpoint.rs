//! Sans-IO endpoint: routes datagrams to sessions by connection ID.
//!
//! The endpoint owns no socket and no clock. A driver loop reads datagrams
//! into [`Endpoint::handle_datagram`], writes whatever
//! [`Endpoint::poll_transmit`] yields, and calls
//! [`Endpoint::handle_timeout`] at [`Endpoint::next_timeout`].
//!
//! The session map lock is held only to look a session up; all session work
//! runs on an `Arc<Session>` outside it. Admitting a responder is the
//! exception: message 1 is answered under the write lock, so the half-open
//! count and the insert cannot race.

use crate::config::SessionConfig;
use crate::error::{SessionError, StateError};
use crate::packet::{ConnectionId, HandshakeMessage, Packet};
use crate::session::{Feedback, Session, SessionState, Transmit};
use crate::stats::StatsSnapshot;
use crate::stream::ReceivedData;
use bytes::Bytes;
use shroud_crypto::{HandshakeRole, Identity, PeerId};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, info, trace};

/// Handle for one session; its connection ID.
pub type SessionHandle = ConnectionId;

/// Final account of a session the endpoint removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retired {
    pub handle: SessionHandle,
    pub state: SessionState,
    pub stats: StatsSnapshot,
}

impl Retired {
    fn of(session: &Session) -> Self {
        Self {
            handle: session.connection_id(),
            state: session.state(),
            stats: session.stats(),
        }
    }
}

pub struct Endpoint {
    identity: Arc<Identity>,
    config: Arc<SessionConfig>,
    sessions: RwLock<HashMap<ConnectionId, Arc<Session>>>,
    retired: Mutex<VecDeque<Retired>>,
}

impl Endpoint {
    pub fn new(identity: Identity, config: SessionConfig) -> shroud_common::Result<Self> {
        config.validate()?;
        info!("endpoint ready as {}", identity.peer_id());
        Ok(Self {
            identity: Arc::new(identity),
            config: Arc::new(config),
            sessions: RwLock::new(HashMap::new()),
            retired: Mutex::new(VecDeque::new()),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn retired(&self) -> std::sync::MutexGuard<'_, VecDeque<Retired>> {
        self.retired.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.read().get(&handle).cloned()
    }

    fn require(&self, handle: SessionHandle) -> Result<Arc<Session>, SessionError> {
        self.session(handle)
            .ok_or_else(|| StateError::UnknownSession.into())
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.read().values().cloned().collect()
    }

    /// Create a session to `peer_addr`. The handshake starts with the first
    /// `send` or an explicit `connect`. `peer_hint` pins the expected
    /// identity.
    pub fn open_session(
        &self,
        peer_addr: SocketAddr,
        peer_hint: Option<PeerId>,
    ) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.write();
        let mut cid = ConnectionId::random();
        while sessions.contains_key(&cid) {
            cid = ConnectionId::random();
        }
        let session = Session::new_initiator(
            cid,
            peer_addr,
            self.identity.clone(),
            peer_hint,
            self.config.clone(),
        )?;
        sessions.insert(cid, Arc::new(session));
        info!("session {} opened to {}", cid, peer_addr);
        Ok(cid)
    }

    pub fn connect(&self, handle: SessionHandle, now: Instant) -> Result<(), SessionError> {
        self.require(handle)?.connect(now)
    }

    pub fn send(
        &self,
        handle: SessionHandle,
        stream_id: u16,
        data: Bytes,
        now: Instant,
    ) -> Result<(), SessionError> {
        self.require(handle)?.send(stream_id, data, false, now)
    }

    /// Send the final bytes of a stream.
    pub fn finish_stream(
        &self,
        handle: SessionHandle,
        stream_id: u16,
        data: Bytes,
        now: Instant,
    ) -> Result<(), SessionError> {
        self.require(handle)?.send(stream_id, data, true, now)
    }

    pub fn close(&self, handle: SessionHandle, now: Instant) -> Result<(), SessionError> {
        self.require(handle)?.close(now)
    }

    /// Everything delivered so far, across sessions, in per-stream order.
    ///
    /// The iterator is lazy and ends once every session's queue is empty;
    /// call again after more datagrams arrive.
    pub fn poll_received(&self) -> impl Iterator<Item = (SessionHandle, ReceivedData)> {
        let sessions = self.snapshot();
        let mut index = 0;
        std::iter::from_fn(move || {
            while let Some(session) = sessions.get(index) {
                if let Some(data) = session.poll_received() {
                    return Some((session.connection_id(), data));
                }
                index += 1;
            }
            None
        })
    }

    pub fn poll_feedback(&self) -> Option<(SessionHandle, Feedback)> {
        self.snapshot()
            .into_iter()
            .find_map(|s| s.poll_feedback().map(|f| (s.connection_id(), f)))
    }

    pub fn poll_transmit(&self) -> Option<Transmit> {
        self.snapshot().into_iter().find_map(|s| s.poll_transmit())
    }

    /// A finished responder gives way to a fresh message 1 on its ID.
    fn restartable(session: &Session) -> bool {
        session.state().is_terminal() && session.role() == HandshakeRole::Responder
    }

    /// Route one inbound datagram. A handshake message 1 for an unknown
    /// connection ID creates a responder session, unless `max_half_open`
    /// responders are already waiting for message 3.
    pub fn handle_datagram(
        &self,
        from: SocketAddr,
        datagram: Bytes,
        now: Instant,
    ) -> Result<SessionHandle, SessionError> {
        let packet = Packet::decode(datagram)?;
        let cid = packet.connection_id;

        if let Some(session) = self.session(cid) {
            let restart = Self::restartable(&session)
                && packet.handshake_message()? == Some(HandshakeMessage::First);
            if !restart {
                session.handle_packet(packet, from, now)?;
                return Ok(cid);
            }
        } else if packet.handshake_message()? != Some(HandshakeMessage::First) {
            trace!("dropping datagram for unknown session {} from {}", cid, from);
            return Err(StateError::UnknownSession.into());
        }
        self.accept(cid, packet, from, now)
    }

    fn accept(
        &self,
        cid: ConnectionId,
        packet: Packet,
        from: SocketAddr,
        now: Instant,
    ) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.write();
        // Another message 1 for this ID got here first.
        if let Some(existing) = sessions.get(&cid).filter(|s| !Self::restartable(s)).cloned() {
            drop(sessions);
            existing.handle_packet(packet, from, now)?;
            return Ok(cid);
        }

        let limit = self.config.max_half_open;
        if sessions.values().filter(|s| s.is_half_open()).count() >= limit {
            debug!("dropping message 1 for {} from {}: half-open limit", cid, from);
            return Err(StateError::HalfOpenLimit(limit).into());
        }

        let session = Session::new_responder(cid, from, self.identity.clone(), self.config.clone());
        session.handle_packet(packet, from, now)?;
        match sessions.entry(cid) {
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(Arc::new(session));
                self.retired().push_back(Retired::of(&previous));
                info!("session {} restarted from {}", cid, from);
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(session));
                info!("session {} accepted from {}", cid, from);
            }
        }
        Ok(cid)
    }

    /// Drive every session's timers, then remove closed and failed sessions
    /// that have nothing left for the application. Their final counters
    /// come out of [`Endpoint::poll_retired`].
    pub fn handle_timeout(&self, now: Instant) {
        for session in self.snapshot() {
            if let Err(e) = session.handle_timeout(now) {
                debug!("session {} timeout: {}", session.connection_id(), e);
            }
        }

        let mut sessions = self.write();
        let mut retired = self.retired();
        sessions.retain(|cid, session| {
            let done = session.state().is_terminal() && session.is_drained();
            if done {
                debug!("session {} retired", cid);
                retired.push_back(Retired::of(session));
            }
            !done
        });
    }

    pub fn poll_retired(&self) -> Option<Retired> {
        self.retired().pop_front()
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.snapshot().iter().filter_map(|s| s.next_timeout()).min()
    }

    pub fn state(&self, handle: SessionHandle) -> Result<SessionState, SessionError> {
        Ok(self.require(handle)?.state())
    }

    pub fn stats(&self, handle: SessionHandle) -> Result<StatsSnapshot, SessionError> {
        Ok(self.require(handle)?.stats())
    }

    /// Authenticated identity of the remote side.
    pub fn remote_peer_id(&self, handle: SessionHandle) -> Result<Option<PeerId>, SessionError> {
        Ok(self.require(handle)?.peer_id())
    }

    pub fn fingerprint(&self, handle: SessionHandle) -> Result<Option<String>, SessionError> {
        Ok(self.require(handle)?.fingerprint())
    }

    pub fn session_count(&self) -> usize {
        self.read().len()
    }

    /// Remove every closed and failed session now, returning their final
    /// counters.
    pub fn reap(&self) -> Vec<(SessionHandle, StatsSnapshot)> {
        let mut sessions = self.write();
        let done: Vec<ConnectionId> = sessions
            .iter()
            .filter(|(_, s)| s.state().is_terminal())
            .map(|(cid, _)| *cid)
            .collect();
        done.into_iter()
            .filter_map(|cid| {
                let session = sessions.remove(&cid)?;
                debug!("session {} reaped", cid);
                Some((cid, session.stats()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_crypto::Initiator;
    use std::time::Duration;

    fn endpoint() -> Endpoint {
        Endpoint::new(Identity::generate(), SessionConfig::default()).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Move datagrams between two endpoints until both are quiet.
    fn pump(a: &Endpoint, a_addr: SocketAddr, b: &Endpoint, b_addr: SocketAddr, now: Instant) {
        loop {
            let mut moved = false;
            while let Some(t) = a.poll_transmit() {
                assert_eq!(t.destination, b_addr);
                let _ = b.handle_datagram(a_addr, t.payload, now);
                moved = true;
            }
            while let Some(t) = b.poll_transmit() {
                assert_eq!(t.destination, a_addr);
                let _ = a.handle_datagram(b_addr, t.payload, now);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn test_accepts_and_delivers() {
        let (a, b) = (endpoint(), endpoint());
        let now = Instant::now();
        let handle = a.open_session(addr(2), Some(b.peer_id())).unwrap();
        assert_eq!(a.state(handle).unwrap(), SessionState::Idle);

        a.send(handle, 16, Bytes::from_static(b"hello"), now).unwrap();
        pump(&a, addr(1), &b, addr(2), now);

        assert_eq!(a.state(handle).unwrap(), SessionState::Established);
        assert_eq!(b.session_count(), 1);
        assert_eq!(b.remote_peer_id(handle).unwrap(), Some(a.peer_id()));
        assert_eq!(a.fingerprint(handle).unwrap(), b.fingerprint(handle).unwrap());

        let received: Vec<_> = b.poll_received().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, handle);
        assert_eq!(received[0].1.stream_id, 16);
        assert_eq!(received[0].1.data, Bytes::from_static(b"hello"));
        assert_eq!(b.poll_received().count(), 0);
    }

    #[test]
    fn test_pinned_identity_mismatch_never_establishes() {
        let (a, b, imposter) = (endpoint(), endpoint(), endpoint());
        let now = Instant::now();
        let handle = a.open_session(addr(2), Some(imposter.peer_id())).unwrap();
        a.send(handle, 16, Bytes::from_static(b"secret"), now).unwrap();
        pump(&a, addr(1), &b, addr(2), now);

        assert_eq!(a.state(handle).unwrap(), SessionState::Handshaking);
        assert_eq!(b.poll_received().count(), 0);
    }

    #[test]
    fn test_unknown_session_dropped() {
        let b = endpoint();
        let packet = Packet {
            connection_id: ConnectionId::random(),
            epoch: 0,
            sequence: 0,
            body: Bytes::from(vec![0u8; 64]),
        };
        assert_eq!(
            b.handle_datagram(addr(1), packet.encode(), Instant::now()),
            Err(SessionError::State(StateError::UnknownSession))
        );
        assert_eq!(b.session_count(), 0);
    }

    #[test]
    fn test_garbage_message_1_creates_no_session() {
        let b = endpoint();
        let packet = Packet::handshake(
            ConnectionId::random(),
            HandshakeMessage::First,
            Bytes::from_static(b"short"),
        );
        assert!(b
            .handle_datagram(addr(1), packet.encode(), Instant::now())
            .is_err());
        assert_eq!(b.session_count(), 0);
    }

    #[test]
    fn test_operations_on_unknown_handle() {
        let a = endpoint();
        let handle = ConnectionId::random();
        let now = Instant::now();
        let unknown = Err(SessionError::State(StateError::UnknownSession));
        assert_eq!(a.send(handle, 16, Bytes::new(), now), unknown);
        assert_eq!(a.close(handle, now), unknown);
        assert!(a.stats(handle).is_err());
    }

    #[test]
    fn test_reap_after_close() {
        let (a, b) = (endpoint(), endpoint());
        let now = Instant::now();
        let handle = a.open_session(addr(2), None).unwrap();
        a.connect(handle, now).unwrap();
        pump(&a, addr(1), &b, addr(2), now);
        a.close(handle, now).unwrap();
        pump(&a, addr(1), &b, addr(2), now);

        let reaped = a.reap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, handle);
        assert_eq!(b.reap().len(), 1);
        assert_eq!(a.session_count(), 0);
    }

    fn message_1(now: Instant) -> Bytes {
        let mut initiator = Initiator::new(
            Arc::new(Identity::generate()),
            None,
            now + Duration::from_secs(5),
        );
        Bytes::from(initiator.write_message_1(now).unwrap())
    }

    #[test]
    fn test_spoofed_message_1_flood_is_bounded() {
        let config = SessionConfig {
            max_half_open: 64,
            ..Default::default()
        };
        let b = Endpoint::new(Identity::generate(), config).unwrap();
        let now = Instant::now();
        let body = message_1(now);

        let mut dropped = 0;
        for port in 0..2000u16 {
            let packet =
                Packet::handshake(ConnectionId::random(), HandshakeMessage::First, body.clone());
            match b.handle_datagram(addr(port), packet.encode(), now) {
                Ok(_) => {}
                Err(SessionError::State(StateError::HalfOpenLimit(64))) => dropped += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(b.session_count(), 64);
        assert_eq!(dropped, 2000 - 64);

        b.handle_timeout(now + Duration::from_secs(60));
        assert_eq!(b.session_count(), 0);
        let retired: Vec<Retired> = std::iter::from_fn(|| b.poll_retired()).collect();
        assert_eq!(retired.len(), 64);
        assert!(retired.iter().all(|r| r.state == SessionState::Failed));
        assert!(b.poll_transmit().is_none());

        // Capacity is back once the half-open sessions are gone.
        let packet = Packet::handshake(ConnectionId::random(), HandshakeMessage::First, body);
        b.handle_datagram(addr(1), packet.encode(), now).unwrap();
        assert_eq!(b.session_count(), 1);
    }

    #[test]
    fn test_concurrent_message_1_admits_one_session() {
        let b = endpoint();
        let now = Instant::now();
        let cid = ConnectionId::random();
        let datagram = Packet::handshake(cid, HandshakeMessage::First, message_1(now)).encode();

        std::thread::scope(|scope| {
            for port in 0..8 {
                let (b, datagram) = (&b, datagram.clone());
                scope.spawn(move || {
                    let _ = b.handle_datagram(addr(port), datagram, now);
                });
            }
        });
        assert_eq!(b.session_count(), 1);
        assert_eq!(b.state(cid).unwrap(), SessionState::Handshaking);
        assert!(b.poll_retired().is_none());
    }

    #[test]
    fn test_timeout_retires_closed_sessions() {
        let (a, b) = (endpoint(), endpoint());
        let now = Instant::now();
        let handle = a.open_session(addr(2), None).unwrap();
        a.connect(handle, now).unwrap();
        pump(&a, addr(1), &b, addr(2), now);
        a.close(handle, now).unwrap();
        pump(&a, addr(1), &b, addr(2), now);

        // The peer's CLOSE is still waiting for the application.
        b.handle_timeout(now);
        assert_eq!(b.session_count(), 1);
        while b.poll_feedback().is_some() {}
        b.handle_timeout(now);
        assert_eq!(b.session_count(), 0);

        while a.poll_feedback().is_some() {}
        a.handle_timeout(now);
        let retired = a.poll_retired().unwrap();
        assert_eq!(retired.handle, handle);
        assert_eq!(retired.state, SessionState::Closed);
        assert!(retired.stats.records_sent > 0);
        assert!(a.poll_retired().is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            pad_to: Some(0),
            ..Default::default()
        };
        assert!(Endpoint::new(Identity::generate(), config).is_err());
    }

    #[test]
    fn test_next_timeout_tracks_handshake() {
        let a = endpoint();
        let now = Instant::now();
        assert_eq!(a.next_timeout(), None);
        let handle = a.open_session(addr(2), None).unwrap();
        a.connect(handle, now).unwrap();
        let next = a.next_timeout().unwrap();
        assert!(next > now + Duration::from_millis(5_000));
        assert!(next <= now + Duration::from_millis(5_001));
    }
}
