//! Record cipher: XChaCha20-Poly1305 keyed per message by the ratchet.
//!
//! # Nonces
//!
//! The 24-byte nonce is derived from the record number, never random and
//! never sent:
//!
//! ```text
//! [4 bytes: epoch BE] [8 bytes: sequence BE] [12 bytes: zero]
//! ```
//!
//! Each message key is used exactly once, so the nonce only has to be
//! unique per key; tying it to the record number keeps it that way even if
//! a key were ever reused by mistake.
//!
//! # Associated data
//!
//! `context || epoch BE || sequence BE`, where `context` is the connection
//! id. The outer datagram header is therefore authenticated.
//!
//! # Receive order
//!
//! 1. epoch known to the ratchet, else [`CryptoError::UnknownEpoch`]
//! 2. replay window check, else [`CryptoError::Replay`]
//! 3. derive the key without mutating the chain
//! 4. decrypt, else [`CryptoError::AuthenticationFailed`]
//! 5. consume the key and mark the window
//!
//! Steps 1-4 leave no trace, so forged or replayed records cost a lookup
//! and at most one AEAD attempt.

use std::time::Instant;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use tracing::trace;

use crate::error::CryptoError;
use crate::noise::HandshakeOutcome;
use crate::ratchet::{self, RatchetConfig, ReceivingRatchet, RekeyApplied, RekeyProposal, SendingRatchet};
use crate::seq_window::SequenceWindow;

/// AEAD key length.
pub const KEY_LEN: usize = 32;
/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;
/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Nonce for record `(epoch, sequence)`.
pub fn record_nonce(epoch: u32, sequence: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&epoch.to_be_bytes());
    nonce[4..12].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Associated data for record `(epoch, sequence)` under `context`.
pub fn record_aad(context: &[u8], epoch: u32, sequence: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(context.len() + 12);
    aad.extend_from_slice(context);
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad.extend_from_slice(&sequence.to_be_bytes());
    aad
}

/// An encrypted record ready for framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    pub epoch: u32,
    pub sequence: u64,
    /// Ciphertext with the 16-byte tag appended.
    pub ciphertext: Vec<u8>,
}

/// A decrypted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRecord {
    pub epoch: u32,
    pub sequence: u64,
    pub plaintext: Vec<u8>,
}

/// Outbound half.
pub struct RecordSealer {
    ratchet: SendingRatchet,
}

impl RecordSealer {
    /// Encrypt `plaintext` under the next message key.
    pub fn seal(&mut self, context: &[u8], plaintext: &[u8]) -> Result<SealedRecord, CryptoError> {
        let key = self.ratchet.next_key()?;
        let (epoch, sequence) = (key.epoch(), key.index());

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce = record_nonce(epoch, sequence);
        let aad = record_aad(context, epoch, sequence);
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::RecordTooLarge)?;

        Ok(SealedRecord {
            epoch,
            sequence,
            ciphertext,
        })
    }

    pub fn epoch(&self) -> u32 {
        self.ratchet.epoch()
    }

    pub fn rekey_due(&self, now: Instant) -> bool {
        self.ratchet.rekey_due(now)
    }

    pub fn next_rekey_deadline(&self) -> Instant {
        self.ratchet.schedule().next_deadline()
    }

    pub fn pending_rekey(&self) -> Option<RekeyProposal> {
        self.ratchet.pending_proposal()
    }

    pub fn begin_rekey(&mut self) -> Result<RekeyProposal, CryptoError> {
        self.ratchet.begin_rekey()
    }

    pub fn commit_rekey(&mut self, epoch: u32, now: Instant) -> Result<bool, CryptoError> {
        self.ratchet.commit_rekey(epoch, now)
    }
}

/// Inbound half: receiving ratchet plus one replay window per live epoch.
pub struct RecordOpener {
    ratchet: ReceivingRatchet,
    windows: Vec<(u32, SequenceWindow)>,
    window_size: u64,
}

impl RecordOpener {
    fn window(&mut self, epoch: u32) -> &mut SequenceWindow {
        let pos = match self.windows.iter().position(|(e, _)| *e == epoch) {
            Some(pos) => pos,
            None => {
                self.windows
                    .push((epoch, SequenceWindow::with_size(self.window_size)));
                self.windows.len() - 1
            }
        };
        &mut self.windows[pos].1
    }

    /// Authenticate and decrypt one record.
    pub fn open(
        &mut self,
        context: &[u8],
        epoch: u32,
        sequence: u64,
        ciphertext: &[u8],
    ) -> Result<OpenedRecord, CryptoError> {
        if !self.ratchet.known_epochs().contains(&epoch) {
            return Err(CryptoError::UnknownEpoch(epoch));
        }
        if !self.window(epoch).check(sequence) {
            return Err(CryptoError::Replay { epoch, sequence });
        }

        let key = self.ratchet.peek_key(epoch, sequence)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce = record_nonce(epoch, sequence);
        let aad = record_aad(context, epoch, sequence);
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        drop(key);

        self.ratchet.commit(epoch, sequence)?;
        self.window(epoch).check_and_update(sequence);
        trace!("opened record epoch {} sequence {}", epoch, sequence);

        Ok(OpenedRecord {
            epoch,
            sequence,
            plaintext,
        })
    }

    pub fn epoch(&self) -> u32 {
        self.ratchet.epoch()
    }

    /// Install the peer's new sending chain; drops windows of retired epochs.
    pub fn apply_rekey(&mut self, proposal: &RekeyProposal) -> Result<RekeyApplied, CryptoError> {
        let applied = self.ratchet.apply_rekey(proposal)?;
        let live = self.ratchet.known_epochs();
        self.windows.retain(|(e, _)| live.contains(e));
        Ok(applied)
    }
}

/// Build both record halves from a completed handshake.
pub fn record_pair(
    outcome: HandshakeOutcome,
    config: &RatchetConfig,
    replay_window: u64,
    now: Instant,
) -> Result<(RecordSealer, RecordOpener), CryptoError> {
    let (sending, receiving) = ratchet::split(outcome, config, now)?;
    Ok((
        RecordSealer { ratchet: sending },
        RecordOpener {
            ratchet: receiving,
            windows: Vec::new(),
            window_size: replay_window,
        },
    ))
}
