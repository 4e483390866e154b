//! Session configuration.

use crate::frame::{FRAME_HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::stream::StreamConfig;
use serde::{Deserialize, Serialize};
use shroud_common::{Error, Result};
use shroud_crypto::seq_window::MAX_WINDOW_SIZE;
use shroud_crypto::RatchetConfig;
use std::path::Path;
use std::time::Duration;

/// Largest padding bucket; a PAD frame must fit its length field.
pub const MAX_PAD_BUCKET: usize = 16 * 1024;

/// Tunables shared by every session of an endpoint. Missing fields in a
/// config file take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-attempt handshake deadline.
    pub handshake_timeout_ms: u64,
    /// Attempts before the session fails.
    pub handshake_attempts: u32,
    pub rekey_interval_secs: u64,
    pub rekey_message_limit: u64,
    pub max_skip: u64,
    pub skipped_key_capacity: usize,
    pub replay_window: u64,
    pub max_frame_payload: usize,
    /// Out-of-order bytes buffered per stream before backpressure.
    pub max_reorder_bytes: usize,
    pub stream_idle_timeout_ms: u64,
    /// How long Closing waits for the peer's CLOSE|ACK.
    pub close_grace_ms: u64,
    /// Violations tolerated before the session fails.
    pub protocol_violation_threshold: u32,
    /// Pad every record to a multiple of this many bytes.
    pub pad_to: Option<usize>,
    /// Responder sessions awaiting message 3 before further message 1
    /// packets are dropped.
    pub max_half_open: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            handshake_attempts: 3,
            rekey_interval_secs: 120,
            rekey_message_limit: 1_000_000,
            max_skip: 1_000,
            skipped_key_capacity: 1_000,
            replay_window: 1_024,
            max_frame_payload: 1_200,
            max_reorder_bytes: 256 * 1024,
            stream_idle_timeout_ms: 30_000,
            close_grace_ms: 3_000,
            protocol_violation_threshold: 32,
            pad_to: None,
            max_half_open: 256,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = shroud_common::config::load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_ms == 0 {
            return Err(Error::config("handshake_timeout_ms must be positive"));
        }
        if self.handshake_attempts == 0 {
            return Err(Error::config("handshake_attempts must be positive"));
        }
        if self.rekey_interval_secs == 0 || self.rekey_message_limit == 0 {
            return Err(Error::config("rekey interval and message limit must be positive"));
        }
        if self.max_skip == 0 || self.skipped_key_capacity == 0 {
            return Err(Error::config("max_skip and skipped_key_capacity must be positive"));
        }
        if self.replay_window == 0 || self.replay_window > MAX_WINDOW_SIZE {
            return Err(Error::config(format!(
                "replay_window must be in 1..={}",
                MAX_WINDOW_SIZE
            )));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_PAYLOAD_LEN {
            return Err(Error::config(format!(
                "max_frame_payload must be in 1..={}",
                MAX_PAYLOAD_LEN
            )));
        }
        if self.max_reorder_bytes < self.max_frame_payload {
            return Err(Error::config("max_reorder_bytes must hold at least one frame"));
        }
        if self.stream_idle_timeout_ms == 0 {
            return Err(Error::config("stream_idle_timeout_ms must be positive"));
        }
        if self.max_half_open == 0 {
            return Err(Error::config("max_half_open must be positive"));
        }
        if let Some(bucket) = self.pad_to {
            if !(FRAME_HEADER_SIZE..=MAX_PAD_BUCKET).contains(&bucket) {
                return Err(Error::config(format!(
                    "pad_to must be in {}..={}",
                    FRAME_HEADER_SIZE, MAX_PAD_BUCKET
                )));
            }
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn ratchet_config(&self) -> RatchetConfig {
        RatchetConfig {
            rekey_interval: Duration::from_secs(self.rekey_interval_secs),
            rekey_message_limit: self.rekey_message_limit,
            max_skip: self.max_skip,
            skipped_key_capacity: self.skipped_key_capacity,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            max_frame_payload: self.max_frame_payload,
            max_reorder_bytes: self.max_reorder_bytes,
            idle_timeout: Duration::from_millis(self.stream_idle_timeout_ms),
        }
    }
}
