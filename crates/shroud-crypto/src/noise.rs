//! Noise XX handshake with indistinguishable keys.
//!
//! Pattern: `Noise_XX_25519_ChaChaPoly_SHA256`, run by `snow`. The DH
//! primitive is swapped for [`ElligatorDh`], whose public keys are
//! Elligator2 representatives, so message 1 is 32 bytes of apparent noise
//! and the static keys inside messages 2 and 3 are representatives too.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                                   Responder
//!     |                                           |
//!     |  -> e                                     |  32 bytes
//!     |------------------------------------------>|
//!     |                                           |
//!     |  <- e, ee, s, es, {ratchet}               |  128 bytes
//!     |<------------------------------------------|
//!     |                                           |
//!     |  -> s, se, {ratchet}                      |  96 bytes
//!     |------------------------------------------>|
//!     |                                           |
//!     [  root key + transcript hash on both sides  ]
//! ```
//!
//! `{ratchet}` is the sender's first ratchet public key, carried as the
//! encrypted handshake payload. The first DH ratchet step uses it.
//!
//! Every step takes `now` and fails with [`HandshakeError::Timeout`] once
//! past the attempt's deadline. Any failure moves the attempt to
//! [`HandshakePhase::Failed`] and drops its `snow` state, ephemeral and
//! chaining keys included; retrying means building a new [`Initiator`] or
//! [`Responder`].

use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;
use shroud_common::helpers::constant_time_eq;
use snow::params::{CipherChoice, DHChoice, HashChoice, NoiseParams};
use snow::resolvers::{CryptoResolver, DefaultResolver, FallbackResolver};
use snow::types::{Cipher, Dh, Hash, Random};
use snow::{Builder, HandshakeState};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::elligator;
use crate::error::HandshakeError;
use crate::identity::{decode_indistinguishable, encode_public_indistinguishable, EphemeralKeypair, Identity};
use crate::kdf;

const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Bound into the transcript so other protocols' handshakes never verify.
const PROLOGUE: &[u8] = b"shroud/1";

const ROOT_LABEL: &[u8] = b"shroud root key";

const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const SEALED_KEY_LEN: usize = KEY_LEN + TAG_LEN;

/// Scratch buffer size for `snow`; every message fits with room to spare.
const MAX_MESSAGE_LEN: usize = 256;

/// Length of message 1 (`e`).
pub const MESSAGE_1_LEN: usize = elligator::REPRESENTATIVE_LEN;
/// Length of message 2 (`e, ee, s, es, {ratchet}`).
pub const MESSAGE_2_LEN: usize = elligator::REPRESENTATIVE_LEN + 2 * SEALED_KEY_LEN;
/// Length of message 3 (`s, se, {ratchet}`).
pub const MESSAGE_3_LEN: usize = 2 * SEALED_KEY_LEN;

/// Progress of one handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Uninitiated,
    SentMessage1,
    AwaitingMessage1,
    SentMessage2,
    ReceivedMessage2,
    Complete,
    Failed,
}

/// Which side of the handshake we played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// X25519 for `snow` whose public keys are Elligator2 representatives.
///
/// `dh` decodes the peer's representative before the scalar multiplication.
/// A static key set through [`Dh::set`] gets a fresh representative per
/// handshake; [`Identity`] guarantees one exists.
#[derive(Default)]
struct ElligatorDh {
    secret: Zeroizing<[u8; KEY_LEN]>,
    representative: [u8; KEY_LEN],
}

impl ElligatorDh {
    fn public(&self) -> PublicKey {
        PublicKey::from(&StaticSecret::from(*self.secret))
    }
}

impl Dh for ElligatorDh {
    fn name(&self) -> &'static str {
        "25519"
    }

    fn pub_len(&self) -> usize {
        KEY_LEN
    }

    fn priv_len(&self) -> usize {
        KEY_LEN
    }

    fn set(&mut self, privkey: &[u8]) {
        let len = privkey.len().min(KEY_LEN);
        self.secret[..len].copy_from_slice(&privkey[..len]);
        self.representative = encode_public_indistinguishable(&self.public()).unwrap_or_default();
    }

    fn generate(&mut self, rng: &mut dyn Random) {
        let mut coins = [0u8; 2];
        loop {
            rng.fill_bytes(&mut self.secret[..]);
            rng.fill_bytes(&mut coins);
            let public = self.public();
            if let Ok(representative) = elligator::encode_with_torsion(&public, coins[0], coins[1]) {
                self.representative = representative;
                return;
            }
        }
    }

    fn pubkey(&self) -> &[u8] {
        &self.representative
    }

    fn privkey(&self) -> &[u8] {
        &self.secret[..]
    }

    fn dh(&self, pubkey: &[u8], out: &mut [u8]) -> Result<(), snow::Error> {
        let remote = elligator::decode(pubkey).map_err(|_| snow::Error::Dh)?;
        let shared = StaticSecret::from(*self.secret).diffie_hellman(&remote);
        if !shared.was_contributory() {
            return Err(snow::Error::Dh);
        }
        out[..KEY_LEN].copy_from_slice(shared.as_bytes());
        Ok(())
    }
}

/// Supplies [`ElligatorDh`]; everything else falls through to `snow`'s
/// default primitives.
struct ElligatorResolver;

impl CryptoResolver for ElligatorResolver {
    fn resolve_rng(&self) -> Option<Box<dyn Random>> {
        None
    }

    fn resolve_dh(&self, choice: &DHChoice) -> Option<Box<dyn Dh>> {
        match choice {
            DHChoice::Curve25519 => Some(Box::<ElligatorDh>::default()),
            _ => None,
        }
    }

    fn resolve_hash(&self, _choice: &HashChoice) -> Option<Box<dyn Hash>> {
        None
    }

    fn resolve_cipher(&self, _choice: &CipherChoice) -> Option<Box<dyn Cipher>> {
        None
    }
}

fn noise_error(err: snow::Error) -> HandshakeError {
    match err {
        snow::Error::Decrypt => HandshakeError::AuthenticationFailed,
        snow::Error::Dh => HandshakeError::Malformed("non-contributory public key"),
        snow::Error::Input => HandshakeError::Malformed("handshake message"),
        _ => HandshakeError::InvalidState("noise state"),
    }
}

fn build_state(identity: &Identity, role: HandshakeRole) -> Result<Box<HandshakeState>, HandshakeError> {
    let params: NoiseParams = NOISE_PATTERN.parse().map_err(noise_error)?;
    let resolver = FallbackResolver::new(Box::new(ElligatorResolver), Box::new(DefaultResolver));
    let secret = identity.secret_bytes();
    let builder = Builder::with_resolver(params, Box::new(resolver))
        .local_private_key(&secret[..])
        .prologue(PROLOGUE);
    let state = match role {
        HandshakeRole::Initiator => builder.build_initiator(),
        HandshakeRole::Responder => builder.build_responder(),
    };
    state.map(Box::new).map_err(noise_error)
}

fn write(state: &mut HandshakeState, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let mut buf = vec![0u8; MAX_MESSAGE_LEN];
    let len = state.write_message(payload, &mut buf).map_err(noise_error)?;
    buf.truncate(len);
    Ok(buf)
}

fn read(state: &mut HandshakeState, message: &[u8]) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
    let mut buf = Zeroizing::new(vec![0u8; MAX_MESSAGE_LEN]);
    let len = state.read_message(message, &mut buf).map_err(noise_error)?;
    buf.truncate(len);
    Ok(buf)
}

fn read_public(bytes: &[u8]) -> Result<PublicKey, HandshakeError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| HandshakeError::Malformed("public key length"))?;
    Ok(PublicKey::from(arr))
}

/// The peer's clean static key, recovered from the representative `snow`
/// received.
fn remote_static(state: &HandshakeState) -> Result<PublicKey, HandshakeError> {
    let representative = state
        .get_remote_static()
        .ok_or(HandshakeError::InvalidState("no remote static"))?;
    decode_indistinguishable(representative)
        .map_err(|_| HandshakeError::Malformed("static key encoding"))
}

fn check_pin(pinned: Option<&[u8; 32]>, remote: &PublicKey) -> Result<(), HandshakeError> {
    match pinned {
        Some(pin) if !constant_time_eq(pin, remote.as_bytes()) => {
            Err(HandshakeError::UnexpectedPeer)
        }
        _ => Ok(()),
    }
}

/// Result of a completed handshake: everything the ratchet needs.
pub struct HandshakeOutcome {
    role: HandshakeRole,
    root_key: Zeroizing<[u8; 32]>,
    transcript_hash: [u8; 32],
    remote_static: PublicKey,
    remote_ratchet: PublicKey,
    local_ratchet: StaticSecret,
}

impl HandshakeOutcome {
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Shared secret from which both directions' chains derive.
    pub fn root_key(&self) -> &[u8; 32] {
        &self.root_key
    }

    /// Identical on both sides; suitable for fingerprint comparison.
    pub fn transcript_hash(&self) -> &[u8; 32] {
        &self.transcript_hash
    }

    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    pub fn remote_ratchet(&self) -> &PublicKey {
        &self.remote_ratchet
    }

    pub(crate) fn into_ratchet_parts(self) -> (HandshakeRole, Zeroizing<[u8; 32]>, StaticSecret, PublicKey) {
        (self.role, self.root_key, self.local_ratchet, self.remote_ratchet)
    }
}

impl std::fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOutcome")
            .field("role", &self.role)
            .field("transcript_hash", &hex::encode(self.transcript_hash))
            .finish_non_exhaustive()
    }
}

/// Handshake initiator.
pub struct Initiator {
    identity: Arc<Identity>,
    pinned: Option<[u8; 32]>,
    deadline: Instant,
    phase: HandshakePhase,
    state: Option<Box<HandshakeState>>,
    remote_static: Option<PublicKey>,
    remote_ratchet: Option<PublicKey>,
    local_ratchet: Option<EphemeralKeypair>,
}

impl Initiator {
    /// Create an attempt that must complete by `deadline`.
    ///
    /// `pinned` restricts the responder to one static public key.
    pub fn new(identity: Arc<Identity>, pinned: Option<PublicKey>, deadline: Instant) -> Self {
        Self {
            identity,
            pinned: pinned.map(|p| p.to_bytes()),
            deadline,
            phase: HandshakePhase::Uninitiated,
            state: None,
            remote_static: None,
            remote_ratchet: None,
            local_ratchet: None,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Write message 1 (-> e).
    pub fn write_message_1(&mut self, now: Instant) -> Result<Vec<u8>, HandshakeError> {
        let result = self.write_message_1_inner(now);
        self.guard(result)
    }

    fn write_message_1_inner(&mut self, now: Instant) -> Result<Vec<u8>, HandshakeError> {
        self.expect_phase(HandshakePhase::Uninitiated, now)?;

        let mut state = build_state(&self.identity, HandshakeRole::Initiator)?;
        let message = write(&mut state, &[])?;

        self.state = Some(state);
        self.phase = HandshakePhase::SentMessage1;
        Ok(message)
    }

    /// Read message 2 (<- e, ee, s, es, {ratchet}).
    pub fn read_message_2(&mut self, message: &[u8], now: Instant) -> Result<(), HandshakeError> {
        let result = self.read_message_2_inner(message, now);
        self.guard(result)
    }

    fn read_message_2_inner(&mut self, message: &[u8], now: Instant) -> Result<(), HandshakeError> {
        self.expect_phase(HandshakePhase::SentMessage1, now)?;
        if message.len() != MESSAGE_2_LEN {
            return Err(HandshakeError::Malformed("message 2 length"));
        }
        let state = self
            .state
            .as_mut()
            .ok_or(HandshakeError::InvalidState("no handshake state"))?;

        let payload = read(state, message)?;
        let remote_static = remote_static(state)?;
        check_pin(self.pinned.as_ref(), &remote_static)?;

        self.remote_static = Some(remote_static);
        self.remote_ratchet = Some(read_public(&payload)?);
        self.phase = HandshakePhase::ReceivedMessage2;
        Ok(())
    }

    /// Write message 3 (-> s, se, {ratchet}). Completes the handshake.
    pub fn write_message_3(&mut self, now: Instant) -> Result<Vec<u8>, HandshakeError> {
        let result = self.write_message_3_inner(now);
        self.guard(result)
    }

    fn write_message_3_inner(&mut self, now: Instant) -> Result<Vec<u8>, HandshakeError> {
        self.expect_phase(HandshakePhase::ReceivedMessage2, now)?;
        let state = self
            .state
            .as_mut()
            .ok_or(HandshakeError::InvalidState("no handshake state"))?;

        let ratchet = EphemeralKeypair::generate();
        let message = write(state, ratchet.public_key().as_bytes())?;

        self.local_ratchet = Some(ratchet);
        self.phase = HandshakePhase::Complete;
        Ok(message)
    }

    /// Consume a completed attempt.
    pub fn finish(mut self) -> Result<HandshakeOutcome, HandshakeError> {
        if self.phase != HandshakePhase::Complete {
            return Err(HandshakeError::InvalidState("handshake not complete"));
        }
        let state = self
            .state
            .take()
            .ok_or(HandshakeError::InvalidState("no handshake state"))?;
        build_outcome(
            HandshakeRole::Initiator,
            state,
            self.remote_static.take(),
            self.remote_ratchet.take(),
            self.local_ratchet.take(),
        )
    }

    fn expect_phase(&self, expected: HandshakePhase, now: Instant) -> Result<(), HandshakeError> {
        if self.phase != expected {
            return Err(HandshakeError::InvalidState("unexpected initiator step"));
        }
        if now > self.deadline {
            return Err(HandshakeError::Timeout);
        }
        Ok(())
    }

    fn guard<T>(&mut self, result: Result<T, HandshakeError>) -> Result<T, HandshakeError> {
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Wipe every secret and refuse further steps.
    pub fn abort(&mut self) {
        self.phase = HandshakePhase::Failed;
        self.state = None;
        self.local_ratchet = None;
    }
}

/// Handshake responder.
pub struct Responder {
    identity: Arc<Identity>,
    pinned: Option<[u8; 32]>,
    deadline: Instant,
    phase: HandshakePhase,
    state: Option<Box<HandshakeState>>,
    remote_static: Option<PublicKey>,
    remote_ratchet: Option<PublicKey>,
    local_ratchet: Option<EphemeralKeypair>,
}

impl Responder {
    pub fn new(identity: Arc<Identity>, pinned: Option<PublicKey>, deadline: Instant) -> Self {
        Self {
            identity,
            pinned: pinned.map(|p| p.to_bytes()),
            deadline,
            phase: HandshakePhase::AwaitingMessage1,
            state: None,
            remote_static: None,
            remote_ratchet: None,
            local_ratchet: None,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Read message 1 (-> e).
    pub fn read_message_1(&mut self, message: &[u8], now: Instant) -> Result<(), HandshakeError> {
        let result = self.read_message_1_inner(message, now);
        self.guard(result)
    }

    fn read_message_1_inner(&mut self, message: &[u8], now: Instant) -> Result<(), HandshakeError> {
        self.expect_phase(HandshakePhase::AwaitingMessage1, now)?;
        if message.len() != MESSAGE_1_LEN {
            return Err(HandshakeError::Malformed("message 1 length"));
        }
        elligator::decode(message)
            .map_err(|_| HandshakeError::Malformed("initiator ephemeral encoding"))?;

        let mut state = build_state(&self.identity, HandshakeRole::Responder)?;
        read(&mut state, message)?;
        self.state = Some(state);
        Ok(())
    }

    /// Write message 2 (<- e, ee, s, es, {ratchet}).
    pub fn write_message_2(&mut self, now: Instant) -> Result<Vec<u8>, HandshakeError> {
        let result = self.write_message_2_inner(now);
        self.guard(result)
    }

    fn write_message_2_inner(&mut self, now: Instant) -> Result<Vec<u8>, HandshakeError> {
        self.expect_phase(HandshakePhase::AwaitingMessage1, now)?;
        let state = self
            .state
            .as_mut()
            .ok_or(HandshakeError::InvalidState("message 1 not read"))?;

        let ratchet = EphemeralKeypair::generate();
        let message = write(state, ratchet.public_key().as_bytes())?;

        self.local_ratchet = Some(ratchet);
        self.phase = HandshakePhase::SentMessage2;
        Ok(message)
    }

    /// Read message 1 and answer it with message 2.
    pub fn respond(&mut self, message_1: &[u8], now: Instant) -> Result<Vec<u8>, HandshakeError> {
        self.read_message_1(message_1, now)?;
        self.write_message_2(now)
    }

    /// Read message 3 (-> s, se, {ratchet}). Completes the handshake.
    pub fn read_message_3(&mut self, message: &[u8], now: Instant) -> Result<(), HandshakeError> {
        let result = self.read_message_3_inner(message, now);
        self.guard(result)
    }

    fn read_message_3_inner(&mut self, message: &[u8], now: Instant) -> Result<(), HandshakeError> {
        self.expect_phase(HandshakePhase::SentMessage2, now)?;
        if message.len() != MESSAGE_3_LEN {
            return Err(HandshakeError::Malformed("message 3 length"));
        }
        let state = self
            .state
            .as_mut()
            .ok_or(HandshakeError::InvalidState("no handshake state"))?;

        let payload = read(state, message)?;
        let remote_static = remote_static(state)?;
        check_pin(self.pinned.as_ref(), &remote_static)?;

        self.remote_static = Some(remote_static);
        self.remote_ratchet = Some(read_public(&payload)?);
        self.phase = HandshakePhase::Complete;
        Ok(())
    }

    /// Consume a completed attempt.
    pub fn finish(mut self) -> Result<HandshakeOutcome, HandshakeError> {
        if self.phase != HandshakePhase::Complete {
            return Err(HandshakeError::InvalidState("handshake not complete"));
        }
        let state = self
            .state
            .take()
            .ok_or(HandshakeError::InvalidState("no handshake state"))?;
        build_outcome(
            HandshakeRole::Responder,
            state,
            self.remote_static.take(),
            self.remote_ratchet.take(),
            self.local_ratchet.take(),
        )
    }

    fn expect_phase(&self, expected: HandshakePhase, now: Instant) -> Result<(), HandshakeError> {
        if self.phase != expected {
            return Err(HandshakeError::InvalidState("unexpected responder step"));
        }
        if now > self.deadline {
            return Err(HandshakeError::Timeout);
        }
        Ok(())
    }

    fn guard<T>(&mut self, result: Result<T, HandshakeError>) -> Result<T, HandshakeError> {
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Wipe every secret and refuse further steps.
    pub fn abort(&mut self) {
        self.phase = HandshakePhase::Failed;
        self.state = None;
        self.local_ratchet = None;
    }
}

fn build_outcome(
    role: HandshakeRole,
    mut state: Box<HandshakeState>,
    remote_static: Option<PublicKey>,
    remote_ratchet: Option<PublicKey>,
    local_ratchet: Option<EphemeralKeypair>,
) -> Result<HandshakeOutcome, HandshakeError> {
    if !state.is_handshake_finished() {
        return Err(HandshakeError::InvalidState("noise handshake unfinished"));
    }
    let remote_static = remote_static.ok_or(HandshakeError::InvalidState("no remote static"))?;
    let remote_ratchet = remote_ratchet.ok_or(HandshakeError::InvalidState("no remote ratchet"))?;
    let local_ratchet = local_ratchet.ok_or(HandshakeError::InvalidState("no local ratchet"))?;

    let transcript_hash: [u8; 32] = state
        .get_handshake_hash()
        .try_into()
        .map_err(|_| HandshakeError::KeyDerivation)?;

    // Both sides hold the same pair; the root binds both directions.
    let (mut i2r, mut r2i) = state.dangerously_get_raw_split();
    let derived = kdf::hkdf2(&i2r, &r2i, ROOT_LABEL);
    i2r.zeroize();
    r2i.zeroize();
    let (root, mut spare) = derived?;
    spare.zeroize();

    Ok(HandshakeOutcome {
        role,
        root_key: Zeroizing::new(root),
        transcript_hash,
        remote_static,
        remote_ratchet,
        local_ratchet: local_ratchet.into_secret(),
    })
}
