//! Static identities, ephemeral keys and their indistinguishable encoding.
//!
//! A **Peer ID** is the base64url-encoded X25519 static public key
//! (32 bytes → 43 characters). Peers may pin each other by Peer ID.
//!
//! Keys go on the wire as Elligator2 representatives of a "dirty" public
//! key, the clean key plus a random small-order point (see
//! [`crate::elligator`]). Ephemerals draw the torsion point once and are
//! regenerated until the result is encodable. Static identities only need
//! one of their eight dirty variants to be encodable.
//!
//! # Example
//!
//! ```
//! use shroud_crypto::identity::{decode_indistinguishable, encode_public_indistinguishable, generate_identity};
//!
//! let identity = generate_identity();
//! let wire = encode_public_indistinguishable(identity.public_key()).unwrap();
//! let back = decode_indistinguishable(&wire).unwrap();
//! assert_eq!(back.as_bytes(), identity.public_key().as_bytes());
//! ```

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::elligator;
use crate::error::EncodingError;

/// Peer ID: base64url-encoded X25519 static public key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a Peer ID from a static public key.
    pub fn from_public(public: &PublicKey) -> Self {
        Self(URL_SAFE_NO_PAD.encode(public.as_bytes()))
    }

    /// Parse a Peer ID from its string representation.
    pub fn parse(s: &str) -> Result<Self, EncodingError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| EncodingError::InvalidPeerId)?;
        if bytes.len() != 32 {
            return Err(EncodingError::InvalidLength(bytes.len()));
        }
        Ok(Self(s.to_string()))
    }

    /// The static public key this ID names.
    pub fn to_public(&self) -> Result<PublicKey, EncodingError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|_| EncodingError::InvalidPeerId)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| EncodingError::InvalidLength(v.len()))?;
        Ok(PublicKey::from(arr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Long-term X25519 identity.
///
/// The secret is zeroized on drop.
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl Identity {
    /// Generate a new identity whose public key is encodable.
    pub fn generate() -> Self {
        loop {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret);
            if elligator::has_encoding(&public) {
                return Self { secret, public };
            }
        }
    }

    /// Restore an identity from its secret scalar.
    ///
    /// Fails if the resulting public key has no indistinguishable encoding,
    /// since such a key could never be sent on the wire.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Result<Self, EncodingError> {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        if !elligator::has_encoding(&public) {
            return Err(EncodingError::NotEncodable);
        }
        Ok(Self { secret, public })
    }

    /// Secret scalar, for persisting the identity.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public(&self.public)
    }

    pub(crate) fn diffie_hellman(&self, remote: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(remote)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Single-use handshake or ratchet keypair.
///
/// Carries its representative so the encoding randomness is drawn once.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
    representative: [u8; 32],
}

impl EphemeralKeypair {
    /// Generate a fresh encodable keypair.
    pub fn generate() -> Self {
        loop {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret);
            let [torsion, tweak, ..] = OsRng.next_u32().to_le_bytes();
            if let Ok(representative) = elligator::encode_with_torsion(&public, torsion, tweak) {
                return Self {
                    secret,
                    public,
                    representative,
                };
            }
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Uniform-looking wire form of the public key.
    pub fn representative(&self) -> &[u8; 32] {
        &self.representative
    }

    pub(crate) fn diffie_hellman(&self, remote: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(remote)
    }

    pub(crate) fn into_secret(self) -> StaticSecret {
        self.secret
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Generate a new long-term identity.
pub fn generate_identity() -> Identity {
    Identity::generate()
}

/// Encode a public key as 32 uniform-looking bytes.
///
/// Tries the dirty variants from a random starting point and keeps the
/// first encodable one. Fails only for keys without any, which
/// [`Identity::generate`] never produces.
pub fn encode_public_indistinguishable(public: &PublicKey) -> Result<[u8; 32], EncodingError> {
    let [start, tweak, ..] = OsRng.next_u32().to_le_bytes();
    (0..8u8)
        .find_map(|i| elligator::encode_with_torsion(public, start.wrapping_add(i), tweak).ok())
        .ok_or(EncodingError::NotEncodable)
}

/// Decode 32 bytes produced by [`encode_public_indistinguishable`] back to
/// the clean public key.
pub fn decode_indistinguishable(bytes: &[u8]) -> Result<PublicKey, EncodingError> {
    elligator::clear_torsion(&elligator::decode(bytes)?)
}

/// Human-comparable rendering of a handshake transcript hash, for
/// out-of-band verification: eight groups of eight hex digits.
pub fn fingerprint(transcript_hash: &[u8; 32]) -> String {
    transcript_hash
        .chunks(4)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join(" ")
}
