//! Per-session counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters, updated without taking any session lock.
pub struct SessionStats {
    /// Microseconds; zero until the handshake completes.
    handshake_latency_us: AtomicU64,
    handshake_attempts: AtomicU64,
    rekeys: AtomicU64,
    replay_rejections: AtomicU64,
    duplicate_frames: AtomicU64,
    auth_failures: AtomicU64,
    undecryptable: AtomicU64,
    protocol_violations: AtomicU64,
    reserved_stream_drops: AtomicU64,
    backpressure_events: AtomicU64,
    records_sent: AtomicU64,
    records_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            handshake_latency_us: AtomicU64::new(0),
            handshake_attempts: AtomicU64::new(0),
            rekeys: AtomicU64::new(0),
            replay_rejections: AtomicU64::new(0),
            duplicate_frames: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            undecryptable: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            reserved_stream_drops: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            records_sent: AtomicU64::new(0),
            records_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub handshake_latency_us: Option<u64>,
    pub handshake_attempts: u64,
    pub rekeys: u64,
    pub replay_rejections: u64,
    pub duplicate_frames: u64,
    pub auth_failures: u64,
    pub undecryptable: u64,
    pub protocol_violations: u64,
    pub reserved_stream_drops: u64,
    pub backpressure_events: u64,
    pub records_sent: u64,
    pub records_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    /// Datagram bytes, headers included.
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SessionStats {
    pub fn set_handshake_latency(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX).max(1);
        self.handshake_latency_us.store(us, Ordering::Relaxed);
    }

    pub fn handshake_attempt(&self) {
        bump(&self.handshake_attempts);
    }

    pub fn rekey(&self) {
        bump(&self.rekeys);
    }

    pub fn replay(&self) {
        bump(&self.replay_rejections);
    }

    pub fn duplicate_frame(&self) {
        bump(&self.duplicate_frames);
    }

    pub fn auth_failure(&self) {
        bump(&self.auth_failures);
    }

    pub fn undecryptable(&self) {
        bump(&self.undecryptable);
    }

    /// Count a violation; returns the running total.
    pub fn protocol_violation(&self) -> u64 {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reserved_stream_drop(&self) {
        bump(&self.reserved_stream_drops);
    }

    pub fn backpressure(&self) {
        bump(&self.backpressure_events);
    }

    pub fn record_sent(&self, frames: usize, bytes: usize) {
        bump(&self.records_sent);
        self.frames_sent.fetch_add(frames as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn handshake_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn datagram_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, frames: usize) {
        bump(&self.records_received);
        self.frames_received.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let latency = self.handshake_latency_us.load(Ordering::Relaxed);
        StatsSnapshot {
            handshake_latency_us: (latency != 0).then_some(latency),
            handshake_attempts: self.handshake_attempts.load(Ordering::Relaxed),
            rekeys: self.rekeys.load(Ordering::Relaxed),
            replay_rejections: self.replay_rejections.load(Ordering::Relaxed),
            duplicate_frames: self.duplicate_frames.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            undecryptable: self.undecryptable.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            reserved_stream_drops: self.reserved_stream_drops.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = SessionStats::default();
        assert_eq!(stats.snapshot().handshake_latency_us, None);

        stats.set_handshake_latency(Duration::from_millis(3));
        stats.replay();
        stats.replay();
        assert_eq!(stats.protocol_violation(), 1);
        assert_eq!(stats.protocol_violation(), 2);
        stats.record_sent(3, 1200);

        let snap = stats.snapshot();
        assert_eq!(snap.handshake_latency_us, Some(3000));
        assert_eq!(snap.replay_rejections, 2);
        assert_eq!(snap.protocol_violations, 2);
        assert_eq!(snap.frames_sent, 3);
        assert_eq!(snap.bytes_sent, 1200);
    }

    #[test]
    fn test_zero_latency_still_recorded() {
        let stats = SessionStats::default();
        stats.set_handshake_latency(Duration::ZERO);
        assert_eq!(stats.snapshot().handshake_latency_us, Some(1));
    }
}
