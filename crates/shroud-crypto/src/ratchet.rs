//! Symmetric and Diffie-Hellman ratchets.
//!
//! # Chains
//!
//! The handshake root key seeds one chain per direction. A chain advances
//! one HMAC step per message:
//!
//! ```text
//! message_key[n] = HMAC(chain[n], "message")
//! chain[n + 1]   = HMAC(chain[n], "chain")
//! ```
//!
//! so a message key never reveals the chain key it came from, and a later
//! chain key never reveals an earlier one.
//!
//! # DH ratchet
//!
//! Rekeying is sender-triggered and per direction. The sender draws a
//! fresh ratchet keypair, mixes `DH(new, peer_latest)` into its sending root
//! and announces `(new_epoch, peer_key_epoch, new_public)` in a REKEY
//! frame. The receiver repeats the DH with its own key for
//! `peer_key_epoch`, installs the new receiving chain and acknowledges.
//! The sender keeps using the old chain until the ack arrives, so data in
//! flight never stalls; the receiver keeps the previous epoch's chain for
//! late records.
//!
//! # Out-of-order delivery
//!
//! Receiving is split into [`ReceivingRatchet::peek_key`] (derive without
//! mutating) and [`ReceivingRatchet::commit`] (advance, cache skipped keys),
//! so a forged record that fails authentication changes nothing. Skipped
//! keys live in a bounded cache that evicts and wipes the oldest entry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::identity::EphemeralKeypair;
use crate::kdf;
use crate::noise::{HandshakeOutcome, HandshakeRole};

/// Default DH ratchet interval.
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(120);
/// Default DH ratchet message count.
pub const DEFAULT_REKEY_MESSAGE_LIMIT: u64 = 1_000_000;
/// Default maximum gap a single record may open in a receiving chain.
pub const DEFAULT_MAX_SKIP: u64 = 1000;
/// Default skipped-key cache capacity per chain.
pub const DEFAULT_SKIPPED_KEY_CAPACITY: usize = 1000;

/// Own ratchet secrets retained for the peer's rekeys.
const LOCAL_KEYS_RETAINED: usize = 4;

const LABEL_MESSAGE: &[u8] = b"message";
const LABEL_CHAIN: &[u8] = b"chain";
const LABEL_RATCHET: &[u8] = b"shroud ratchet";

/// Ratchet tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetConfig {
    pub rekey_interval: Duration,
    pub rekey_message_limit: u64,
    pub max_skip: u64,
    pub skipped_key_capacity: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            rekey_interval: DEFAULT_REKEY_INTERVAL,
            rekey_message_limit: DEFAULT_REKEY_MESSAGE_LIMIT,
            max_skip: DEFAULT_MAX_SKIP,
            skipped_key_capacity: DEFAULT_SKIPPED_KEY_CAPACITY,
        }
    }
}

/// Single-use message key. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKey {
    key: [u8; 32],
    epoch: u32,
    index: u64,
}

impl MessageKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey")
            .field("epoch", &self.epoch)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct ChainKey {
    key: [u8; 32],
    index: u64,
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Message key for the current index; advances the chain.
    fn step(&mut self) -> Result<[u8; 32], CryptoError> {
        if self.index == u64::MAX {
            return Err(CryptoError::ChainExhausted);
        }
        let message = kdf::hmac(&self.key, LABEL_MESSAGE)?;
        let mut next = kdf::hmac(&self.key, LABEL_CHAIN)?;
        self.key.zeroize();
        self.key = next;
        next.zeroize();
        self.index += 1;
        Ok(message)
    }

    /// Message key for `index >= self.index` without advancing.
    fn derive_ahead(&self, index: u64) -> Result<[u8; 32], CryptoError> {
        let mut key = Zeroizing::new(self.key);
        for _ in self.index..index {
            *key = kdf::hmac(&key, LABEL_CHAIN)?;
        }
        Ok(kdf::hmac(&key, LABEL_MESSAGE)?)
    }
}

/// Fires a DH ratchet step once either the interval has elapsed or the
/// message limit is reached, whichever comes first.
#[derive(Debug, Clone)]
pub struct RekeySchedule {
    interval: Duration,
    message_limit: u64,
    last_step: Instant,
    messages: u64,
}

impl RekeySchedule {
    pub fn new(interval: Duration, message_limit: u64, now: Instant) -> Self {
        Self {
            interval,
            message_limit,
            last_step: now,
            messages: 0,
        }
    }

    pub fn record_message(&mut self) {
        self.messages = self.messages.saturating_add(1);
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_step) >= self.interval
            || self.messages >= self.message_limit
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_step = now;
        self.messages = 0;
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// When the interval would next fire, for timer scheduling.
    pub fn next_deadline(&self) -> Instant {
        self.last_step + self.interval
    }
}

/// DH ratchet announcement carried in a REKEY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyProposal {
    /// Epoch of the sender's new sending chain.
    pub new_epoch: u32,
    /// Which of the receiver's ratchet keys the sender used.
    pub peer_key_epoch: u32,
    /// Sender's new ratchet public key.
    pub public: [u8; 32],
}

/// Result of applying a REKEY on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyApplied {
    /// New receiving chain installed.
    Applied,
    /// Already installed (retransmitted REKEY); acknowledge again.
    Duplicate,
}

/// Ratchet public/secret keys shared by both directions of a session.
///
/// The sending side reads the peer's latest key and records its own new
/// secrets; the receiving side looks up its own secrets and records the
/// peer's new keys.
pub struct RatchetKeyring {
    local: VecDeque<(u32, StaticSecret)>,
    peer: (u32, PublicKey),
}

impl RatchetKeyring {
    fn new(local: StaticSecret, peer: PublicKey) -> Self {
        let mut keys = VecDeque::with_capacity(LOCAL_KEYS_RETAINED);
        keys.push_back((0, local));
        Self {
            local: keys,
            peer: (0, peer),
        }
    }

    fn local(&self, epoch: u32) -> Option<&StaticSecret> {
        self.local
            .iter()
            .find(|(e, _)| *e == epoch)
            .map(|(_, secret)| secret)
    }

    fn insert_local(&mut self, epoch: u32, secret: StaticSecret) {
        if self.local.iter().any(|(e, _)| *e == epoch) {
            return;
        }
        self.local.push_back((epoch, secret));
        while self.local.len() > LOCAL_KEYS_RETAINED {
            // StaticSecret wipes itself on drop.
            self.local.pop_front();
        }
    }

    fn observe_peer(&mut self, epoch: u32, public: PublicKey) {
        if epoch > self.peer.0 {
            self.peer = (epoch, public);
        }
    }

    pub fn peer_epoch(&self) -> u32 {
        self.peer.0
    }
}

pub type SharedKeyring = Arc<Mutex<RatchetKeyring>>;

fn lock_keyring(keyring: &SharedKeyring) -> MutexGuard<'_, RatchetKeyring> {
    keyring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingRekey {
    proposal: RekeyProposal,
    root: Zeroizing<[u8; 32]>,
    chain: ChainKey,
}

/// Sending half: one chain, the schedule, and at most one pending rekey.
///
/// A DH step re-derives only this direction's root and chain; each
/// direction keeps its own root and schedule. The other direction takes in
/// fresh DH material on its own next step, which uses the new public key
/// this step announced.
pub struct SendingRatchet {
    root: Zeroizing<[u8; 32]>,
    chain: ChainKey,
    epoch: u32,
    schedule: RekeySchedule,
    pending: Option<PendingRekey>,
    keyring: SharedKeyring,
}

impl SendingRatchet {
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Next message key on the current chain.
    pub fn next_key(&mut self) -> Result<MessageKey, CryptoError> {
        let index = self.chain.index;
        let key = self.chain.step()?;
        self.schedule.record_message();
        Ok(MessageKey {
            key,
            epoch: self.epoch,
            index,
        })
    }

    pub fn schedule(&self) -> &RekeySchedule {
        &self.schedule
    }

    /// True when the schedule fired and no rekey is already in flight.
    pub fn rekey_due(&self, now: Instant) -> bool {
        self.pending.is_none() && self.schedule.is_due(now)
    }

    pub fn pending_proposal(&self) -> Option<RekeyProposal> {
        self.pending.as_ref().map(|p| p.proposal)
    }

    /// Start a DH ratchet step, or return the in-flight one for
    /// retransmission.
    pub fn begin_rekey(&mut self) -> Result<RekeyProposal, CryptoError> {
        if let Some(pending) = &self.pending {
            return Ok(pending.proposal);
        }

        let new_epoch = self
            .epoch
            .checked_add(1)
            .ok_or(CryptoError::ChainExhausted)?;
        let keypair = EphemeralKeypair::generate();

        let mut keyring = lock_keyring(&self.keyring);
        let (peer_key_epoch, peer_public) = keyring.peer;
        let shared = keypair.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidRekey("non-contributory peer ratchet key"));
        }
        let (root, chain) = kdf::hkdf2(&self.root, shared.as_bytes(), LABEL_RATCHET)?;

        let proposal = RekeyProposal {
            new_epoch,
            peer_key_epoch,
            public: keypair.public_key().to_bytes(),
        };
        keyring.insert_local(new_epoch, keypair.into_secret());
        drop(keyring);

        debug!(
            "rekey proposed: epoch {} -> {} using peer key {}",
            self.epoch, new_epoch, peer_key_epoch
        );
        self.pending = Some(PendingRekey {
            proposal,
            root: Zeroizing::new(root),
            chain: ChainKey::new(chain),
        });
        Ok(proposal)
    }

    /// Switch to the pending chain once the peer acknowledged `epoch`.
    ///
    /// Returns `false` for a repeated ack of the current epoch.
    pub fn commit_rekey(&mut self, epoch: u32, now: Instant) -> Result<bool, CryptoError> {
        match self.pending.take() {
            Some(pending) if pending.proposal.new_epoch == epoch => {
                self.root = pending.root;
                self.chain = pending.chain;
                self.epoch = epoch;
                self.schedule.reset(now);
                debug!("rekey committed: sending epoch {}", epoch);
                Ok(true)
            }
            other => {
                self.pending = other;
                if epoch == self.epoch {
                    Ok(false)
                } else {
                    Err(CryptoError::InvalidRekey("ack for unknown epoch"))
                }
            }
        }
    }
}

struct ReceiveChain {
    epoch: u32,
    chain: ChainKey,
    public: Option<[u8; 32]>,
    skipped: BTreeMap<u64, [u8; 32]>,
}

impl ReceiveChain {
    fn new(epoch: u32, chain: [u8; 32], public: Option<[u8; 32]>) -> Self {
        Self {
            epoch,
            chain: ChainKey::new(chain),
            public,
            skipped: BTreeMap::new(),
        }
    }

    fn cache(&mut self, index: u64, key: [u8; 32], capacity: usize) {
        self.skipped.insert(index, key);
        while self.skipped.len() > capacity {
            if let Some((_, mut evicted)) = self.skipped.pop_first() {
                evicted.zeroize();
            }
        }
    }
}

impl Drop for ReceiveChain {
    fn drop(&mut self) {
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

/// Receiving half: the current and previous epoch's chains.
pub struct ReceivingRatchet {
    root: Zeroizing<[u8; 32]>,
    current: ReceiveChain,
    previous: Option<ReceiveChain>,
    max_skip: u64,
    capacity: usize,
    keyring: SharedKeyring,
}

impl ReceivingRatchet {
    pub fn epoch(&self) -> u32 {
        self.current.epoch
    }

    /// Epochs that can still decrypt, newest first.
    pub fn known_epochs(&self) -> Vec<u32> {
        let mut epochs = vec![self.current.epoch];
        if let Some(prev) = &self.previous {
            epochs.push(prev.epoch);
        }
        epochs
    }

    fn chain(&self, epoch: u32) -> Option<&ReceiveChain> {
        if self.current.epoch == epoch {
            return Some(&self.current);
        }
        self.previous.as_ref().filter(|c| c.epoch == epoch)
    }

    fn chain_mut(&mut self, epoch: u32) -> Option<&mut ReceiveChain> {
        if self.current.epoch == epoch {
            return Some(&mut self.current);
        }
        self.previous.as_mut().filter(|c| c.epoch == epoch)
    }

    pub fn skipped_len(&self, epoch: u32) -> usize {
        self.chain(epoch).map_or(0, |c| c.skipped.len())
    }

    /// Derive the key for `(epoch, index)` without changing any state.
    pub fn peek_key(&self, epoch: u32, index: u64) -> Result<MessageKey, CryptoError> {
        let chain = self.chain(epoch).ok_or(CryptoError::UnknownEpoch(epoch))?;

        let key = if index < chain.chain.index {
            *chain
                .skipped
                .get(&index)
                .ok_or(CryptoError::KeyUnavailable {
                    epoch,
                    sequence: index,
                })?
        } else {
            let gap = index - chain.chain.index;
            if gap > self.max_skip {
                return Err(CryptoError::SkipLimitExceeded {
                    requested: gap,
                    limit: self.max_skip,
                });
            }
            chain.chain.derive_ahead(index)?
        };

        Ok(MessageKey { key, epoch, index })
    }

    /// Consume the key for `(epoch, index)` after successful decryption.
    pub fn commit(&mut self, epoch: u32, index: u64) -> Result<(), CryptoError> {
        let max_skip = self.max_skip;
        let capacity = self.capacity;
        let chain = self
            .chain_mut(epoch)
            .ok_or(CryptoError::UnknownEpoch(epoch))?;

        if index < chain.chain.index {
            let mut key = chain.skipped.remove(&index).ok_or(CryptoError::KeyUnavailable {
                epoch,
                sequence: index,
            })?;
            key.zeroize();
            return Ok(());
        }

        let gap = index - chain.chain.index;
        if gap > max_skip {
            return Err(CryptoError::SkipLimitExceeded {
                requested: gap,
                limit: max_skip,
            });
        }
        while chain.chain.index < index {
            let skipped_index = chain.chain.index;
            let key = chain.chain.step()?;
            chain.cache(skipped_index, key, capacity);
        }
        let mut used = chain.chain.step()?;
        used.zeroize();
        Ok(())
    }

    /// Install the receiving chain announced by a REKEY frame.
    pub fn apply_rekey(&mut self, proposal: &RekeyProposal) -> Result<RekeyApplied, CryptoError> {
        if proposal.new_epoch == self.current.epoch {
            return match self.current.public {
                Some(public) if public == proposal.public => Ok(RekeyApplied::Duplicate),
                _ => Err(CryptoError::InvalidRekey("conflicting key for current epoch")),
            };
        }
        if Some(proposal.new_epoch) != self.current.epoch.checked_add(1) {
            return Err(CryptoError::InvalidRekey("unexpected epoch"));
        }

        let peer_public = PublicKey::from(proposal.public);
        let mut keyring = lock_keyring(&self.keyring);
        let secret = keyring
            .local(proposal.peer_key_epoch)
            .ok_or(CryptoError::InvalidRekey("unknown local ratchet key"))?;
        let shared = secret.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidRekey("non-contributory ratchet key"));
        }
        let (root, chain) = kdf::hkdf2(&self.root, shared.as_bytes(), LABEL_RATCHET)?;
        keyring.observe_peer(proposal.new_epoch, peer_public);
        drop(keyring);

        *self.root = root;
        let next = ReceiveChain::new(proposal.new_epoch, chain, Some(proposal.public));
        let retired = std::mem::replace(&mut self.current, next);
        // Dropping the older chain wipes its cache.
        self.previous = Some(retired);

        debug!("rekey applied: receiving epoch {}", proposal.new_epoch);
        Ok(RekeyApplied::Applied)
    }

    /// Forget the previous epoch once it can no longer be needed.
    pub fn retire_previous(&mut self) {
        self.previous = None;
    }
}

/// Derive both halves of the ratchet from a completed handshake.
pub fn split(
    outcome: HandshakeOutcome,
    config: &RatchetConfig,
    now: Instant,
) -> Result<(SendingRatchet, ReceivingRatchet), CryptoError> {
    let (role, root, local_ratchet, remote_ratchet) = outcome.into_ratchet_parts();

    let i2r_root = Zeroizing::new(kdf::expand(&root, b"shroud i2r root")?);
    let i2r_chain = kdf::expand(&root, b"shroud i2r chain")?;
    let r2i_root = Zeroizing::new(kdf::expand(&root, b"shroud r2i root")?);
    let r2i_chain = kdf::expand(&root, b"shroud r2i chain")?;

    let (send_root, send_chain, recv_root, recv_chain) = match role {
        HandshakeRole::Initiator => (i2r_root, i2r_chain, r2i_root, r2i_chain),
        HandshakeRole::Responder => (r2i_root, r2i_chain, i2r_root, i2r_chain),
    };

    let keyring = Arc::new(Mutex::new(RatchetKeyring::new(local_ratchet, remote_ratchet)));

    let sending = SendingRatchet {
        root: send_root,
        chain: ChainKey::new(send_chain),
        epoch: 0,
        schedule: RekeySchedule::new(config.rekey_interval, config.rekey_message_limit, now),
        pending: None,
        keyring: keyring.clone(),
    };
    let receiving = ReceivingRatchet {
        root: recv_root,
        current: ReceiveChain::new(0, recv_chain, None),
        previous: None,
        max_skip: config.max_skip,
        capacity: config.skipped_key_capacity,
        keyring,
    };
    Ok((sending, receiving))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_identity;
    use crate::noise::{Initiator, Responder};

    fn ratchet_pair(
        config: &RatchetConfig,
        now: Instant,
    ) -> ((SendingRatchet, ReceivingRatchet), (SendingRatchet, ReceivingRatchet)) {
        let deadline = now + Duration::from_secs(5);
        let mut initiator = Initiator::new(Arc::new(generate_identity()), None, deadline);
        let mut responder = Responder::new(Arc::new(generate_identity()), None, deadline);
        let msg1 = initiator.write_message_1(now).unwrap();
        let msg2 = responder.respond(&msg1, now).unwrap();
        initiator.read_message_2(&msg2, now).unwrap();
        let msg3 = initiator.write_message_3(now).unwrap();
        responder.read_message_3(&msg3, now).unwrap();

        (
            split(initiator.finish().unwrap(), config, now).unwrap(),
            split(responder.finish().unwrap(), config, now).unwrap(),
        )
    }

    #[test]
    fn test_chains_match_across_peers() {
        let now = Instant::now();
        let ((mut a_send, mut a_recv), (mut b_send, mut b_recv)) =
            ratchet_pair(&RatchetConfig::default(), now);

        for i in 0..5 {
            let k = a_send.next_key().unwrap();
            assert_eq!(k.index(), i);
            let peer = b_recv.peek_key(0, i).unwrap();
            assert_eq!(k.as_bytes(), peer.as_bytes());
            b_recv.commit(0, i).unwrap();
        }

        let k = b_send.next_key().unwrap();
        assert_eq!(k.as_bytes(), a_recv.peek_key(0, 0).unwrap().as_bytes());
        a_recv.commit(0, 0).unwrap();
    }

    #[test]
    fn test_directions_are_independent() {
        let now = Instant::now();
        let ((mut a_send, _), (mut b_send, _)) = ratchet_pair(&RatchetConfig::default(), now);
        assert_ne!(a_send.next_key().unwrap().as_bytes(), b_send.next_key().unwrap().as_bytes());
    }

    #[test]
    fn test_message_keys_are_single_use() {
        let now = Instant::now();
        let ((mut send, _), (_, mut recv)) = ratchet_pair(&RatchetConfig::default(), now);
        let k0 = send.next_key().unwrap();
        let k1 = send.next_key().unwrap();
        assert_ne!(k0.as_bytes(), k1.as_bytes());

        recv.commit(0, 0).unwrap();
        assert_eq!(
            recv.peek_key(0, 0).unwrap_err(),
            CryptoError::KeyUnavailable {
                epoch: 0,
                sequence: 0
            }
        );
    }

    #[test]
    fn test_skipped_keys_reverse_order() {
        let now = Instant::now();
        let ((mut send, _), (_, mut recv)) = ratchet_pair(&RatchetConfig::default(), now);
        let keys: Vec<_> = (0..10).map(|_| send.next_key().unwrap()).collect();

        for k in keys.iter().rev() {
            let peer = recv.peek_key(0, k.index()).unwrap();
            assert_eq!(peer.as_bytes(), k.as_bytes());
            recv.commit(0, k.index()).unwrap();
        }
        assert_eq!(recv.skipped_len(0), 0);
    }

    #[test]
    fn test_peek_does_not_mutate() {
        let now = Instant::now();
        let (_, (_, recv)) = ratchet_pair(&RatchetConfig::default(), now);
        let a = recv.peek_key(0, 7).unwrap();
        let b = recv.peek_key(0, 7).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(recv.skipped_len(0), 0);
    }

    #[test]
    fn test_max_skip_is_hard_error() {
        let now = Instant::now();
        let config = RatchetConfig {
            max_skip: 10,
            ..RatchetConfig::default()
        };
        let (_, (_, mut recv)) = ratchet_pair(&config, now);
        assert!(recv.peek_key(0, 10).is_ok());
        assert_eq!(
            recv.peek_key(0, 11).unwrap_err(),
            CryptoError::SkipLimitExceeded {
                requested: 11,
                limit: 10
            }
        );
        assert!(matches!(
            recv.commit(0, 11),
            Err(CryptoError::SkipLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_skipped_cache_evicts_oldest() {
        let now = Instant::now();
        let config = RatchetConfig {
            skipped_key_capacity: 4,
            ..RatchetConfig::default()
        };
        let (_, (_, mut recv)) = ratchet_pair(&config, now);
        recv.commit(0, 8).unwrap();
        assert_eq!(recv.skipped_len(0), 4);
        // 0..=3 evicted, 4..=7 kept
        assert!(recv.peek_key(0, 3).is_err());
        assert!(recv.peek_key(0, 4).is_ok());
    }

    #[test]
    fn test_rekey_flow() {
        let now = Instant::now();
        let ((mut a_send, mut a_recv), (mut b_send, mut b_recv)) =
            ratchet_pair(&RatchetConfig::default(), now);

        let proposal = a_send.begin_rekey().unwrap();
        assert_eq!(proposal.new_epoch, 1);
        assert_eq!(proposal.peer_key_epoch, 0);

        // Still on the old chain until the ack.
        let old = a_send.next_key().unwrap();
        assert_eq!(old.epoch(), 0);

        assert_eq!(b_recv.apply_rekey(&proposal).unwrap(), RekeyApplied::Applied);
        assert_eq!(b_recv.apply_rekey(&proposal).unwrap(), RekeyApplied::Duplicate);
        assert!(a_send.commit_rekey(1, now).unwrap());
        assert!(!a_send.commit_rekey(1, now).unwrap());

        let new = a_send.next_key().unwrap();
        assert_eq!((new.epoch(), new.index()), (1, 0));
        assert_eq!(b_recv.peek_key(1, 0).unwrap().as_bytes(), new.as_bytes());

        // Late record from the old epoch still decrypts.
        assert_eq!(b_recv.peek_key(0, 0).unwrap().as_bytes(), old.as_bytes());

        // Reverse direction rekeys against A's newest key.
        let reverse = b_send.begin_rekey().unwrap();
        assert_eq!(reverse.peer_key_epoch, 1);
        assert_eq!(a_recv.apply_rekey(&reverse).unwrap(), RekeyApplied::Applied);
        assert!(b_send.commit_rekey(1, now).unwrap());
        let k = b_send.next_key().unwrap();
        assert_eq!(a_recv.peek_key(1, 0).unwrap().as_bytes(), k.as_bytes());
    }

    /// What an attacker who read one side's memory at a given moment holds.
    struct Snapshot {
        root: [u8; 32],
        chain: [u8; 32],
        index: u64,
        secrets: Vec<StaticSecret>,
        peer: PublicKey,
    }

    fn snapshot(recv: &ReceivingRatchet) -> Snapshot {
        let keyring = lock_keyring(&recv.keyring);
        Snapshot {
            root: *recv.root,
            chain: recv.current.chain.key,
            index: recv.current.chain.index,
            secrets: keyring.local.iter().map(|(_, s)| s.clone()).collect(),
            peer: keyring.peer.1,
        }
    }

    /// Every message key reachable from `root` through any DH between the
    /// known secrets and the known public keys.
    fn reachable_keys(
        root: &[u8; 32],
        secrets: &[StaticSecret],
        publics: &[PublicKey],
        count: u64,
    ) -> Vec<[u8; 32]> {
        let mut keys = Vec::new();
        for secret in secrets {
            for public in publics {
                let shared = secret.diffie_hellman(public);
                let (_, chain) = kdf::hkdf2(root, shared.as_bytes(), LABEL_RATCHET).unwrap();
                let chain = ChainKey::new(chain);
                keys.extend((0..count).map(|i| chain.derive_ahead(i).unwrap()));
            }
        }
        keys
    }

    #[test]
    fn test_chain_state_never_yields_earlier_keys() {
        let now = Instant::now();
        let ((mut send, _), (_, mut recv)) = ratchet_pair(&RatchetConfig::default(), now);
        let used: Vec<[u8; 32]> = (0..10).map(|_| *send.next_key().unwrap().as_bytes()).collect();
        for index in 0..10 {
            recv.commit(0, index).unwrap();
        }

        let stolen = snapshot(&recv);
        assert_eq!(stolen.index, 10);
        let chain = ChainKey {
            key: stolen.chain,
            index: stolen.index,
        };
        for ahead in 10..200 {
            assert!(!used.contains(&chain.derive_ahead(ahead).unwrap()));
        }
        assert!(!used.contains(&stolen.chain));

        for index in 0..10 {
            assert_eq!(
                recv.peek_key(0, index).unwrap_err(),
                CryptoError::KeyUnavailable {
                    epoch: 0,
                    sequence: index
                }
            );
        }
    }

    #[test]
    fn test_rekeys_heal_both_directions_after_compromise() {
        let now = Instant::now();
        let ((mut a_send, mut a_recv), (mut b_send, mut b_recv)) =
            ratchet_pair(&RatchetConfig::default(), now);

        // B is read out at epoch 0. The stolen state opens current traffic.
        let stolen = snapshot(&b_recv);
        let stolen_send_root = *b_send.root;
        let current = a_send.next_key().unwrap();
        let stolen_chain = ChainKey {
            key: stolen.chain,
            index: stolen.index,
        };
        assert_eq!(&stolen_chain.derive_ahead(current.index()).unwrap(), current.as_bytes());

        // B rekeys with a secret drawn after the compromise.
        let from_b = b_send.begin_rekey().unwrap();
        a_recv.apply_rekey(&from_b).unwrap();
        assert!(b_send.commit_rekey(from_b.new_epoch, now).unwrap());
        let b_key = b_send.next_key().unwrap();
        assert_eq!(b_key.epoch(), 1);

        let b_new = PublicKey::from(from_b.public);
        let guesses = reachable_keys(&stolen_send_root, &stolen.secrets, &[stolen.peer, b_new], 64);
        assert!(!guesses.contains(b_key.as_bytes()));

        // A then rekeys against B's new key.
        let from_a = a_send.begin_rekey().unwrap();
        assert_eq!(from_a.peer_key_epoch, 1);
        b_recv.apply_rekey(&from_a).unwrap();
        assert!(a_send.commit_rekey(from_a.new_epoch, now).unwrap());
        let a_key = a_send.next_key().unwrap();
        assert_eq!(b_recv.peek_key(1, 0).unwrap().as_bytes(), a_key.as_bytes());

        let a_new = PublicKey::from(from_a.public);
        let guesses = reachable_keys(&stolen.root, &stolen.secrets, &[stolen.peer, b_new, a_new], 64);
        assert!(!guesses.contains(a_key.as_bytes()));
    }

    #[test]
    fn test_rekey_rejects_skipped_epoch() {
        let now = Instant::now();
        let ((mut a_send, _), (_, mut b_recv)) = ratchet_pair(&RatchetConfig::default(), now);
        let mut proposal = a_send.begin_rekey().unwrap();
        proposal.new_epoch = 5;
        assert!(matches!(
            b_recv.apply_rekey(&proposal),
            Err(CryptoError::InvalidRekey(_))
        ));
    }

    #[test]
    fn test_schedule_interval() {
        let start = Instant::now();
        let schedule = RekeySchedule::new(DEFAULT_REKEY_INTERVAL, DEFAULT_REKEY_MESSAGE_LIMIT, start);
        assert!(!schedule.is_due(start + Duration::from_millis(119_999)));
        assert!(schedule.is_due(start + Duration::from_secs(120)));
    }

    #[test]
    fn test_schedule_message_limit() {
        let start = Instant::now();
        let mut schedule = RekeySchedule::new(DEFAULT_REKEY_INTERVAL, 1000, start);
        for _ in 0..999 {
            schedule.record_message();
        }
        assert!(!schedule.is_due(start));
        schedule.record_message();
        assert!(schedule.is_due(start));

        schedule.reset(start + Duration::from_secs(1));
        assert!(!schedule.is_due(start + Duration::from_secs(1)));
    }
}
