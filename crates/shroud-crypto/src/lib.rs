//! Cryptographic core for Shroud.
//!
//! This crate provides:
//! - X25519 identities whose public keys have a uniform-looking encoding
//!   (Elligator2), so handshake bytes are indistinguishable from noise
//! - A three-message Noise XX handshake built on that encoding
//! - Symmetric and Diffie-Hellman ratchets with a bounded skipped-key cache
//! - XChaCha20-Poly1305 records with deterministic nonces and replay windows
//!
//! # Design
//!
//! Handshake: `Noise_XX_25519_ChaChaPoly_SHA256` driven by `snow`, with a
//! custom DH primitive whose public keys are Elligator2 representatives
//! instead of raw curve points. The handshake hands a root key to the
//! ratchet, which derives one chain per direction.
//!
//! Records carry an explicit `(epoch, sequence)` so they can be decrypted
//! out of order; the nonce is derived from that pair and never transmitted.

#![forbid(unsafe_code)]

pub mod elligator;
pub mod error;
pub mod identity;
mod kdf;
pub mod noise;
pub mod ratchet;
pub mod record;
pub mod seq_window;

pub use error::{CryptoError, EncodingError, HandshakeError};
pub use identity::{EphemeralKeypair, Identity, PeerId};
pub use noise::{HandshakeOutcome, HandshakePhase, HandshakeRole, Initiator, Responder};
pub use ratchet::{MessageKey, RatchetConfig, RekeyApplied, RekeyProposal, RekeySchedule};
pub use record::{record_pair, OpenedRecord, RecordOpener, RecordSealer, SealedRecord};
pub use seq_window::SequenceWindow;
