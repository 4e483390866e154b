//! Key-derivation primitives shared by the handshake and ratchet.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CryptoError, HandshakeError};

pub(crate) const HASH_LEN: usize = 32;

/// The only failure is an output length HKDF/HMAC cannot produce, which
/// the fixed sizes used here never request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KdfError;

impl From<KdfError> for HandshakeError {
    fn from(_: KdfError) -> Self {
        HandshakeError::KeyDerivation
    }
}

impl From<KdfError> for CryptoError {
    fn from(_: KdfError) -> Self {
        CryptoError::KeyDerivation
    }
}

/// Two 32-byte outputs from HKDF-SHA256 with `salt` and `info`.
pub(crate) fn hkdf2(
    salt: &[u8; HASH_LEN],
    ikm: &[u8],
    info: &[u8],
) -> Result<([u8; HASH_LEN], [u8; HASH_LEN]), KdfError> {
    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), ikm);
    let mut okm = [0u8; 2 * HASH_LEN];
    hk.expand(info, &mut okm).map_err(|_| KdfError)?;

    let mut first = [0u8; HASH_LEN];
    let mut second = [0u8; HASH_LEN];
    first.copy_from_slice(&okm[..HASH_LEN]);
    second.copy_from_slice(&okm[HASH_LEN..]);
    zeroize::Zeroize::zeroize(&mut okm);
    Ok((first, second))
}

/// HKDF-Expand of a uniformly random key with a label.
pub(crate) fn expand(prk: &[u8; HASH_LEN], label: &[u8]) -> Result<[u8; HASH_LEN], KdfError> {
    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| KdfError)?;
    let mut out = [0u8; HASH_LEN];
    hk.expand(label, &mut out).map_err(|_| KdfError)?;
    Ok(out)
}

/// HMAC-SHA256(key, label).
pub(crate) fn hmac(key: &[u8; HASH_LEN], label: &[u8]) -> Result<[u8; HASH_LEN], KdfError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| KdfError)?;
    mac.update(label);
    Ok(mac.finalize().into_bytes().into())
}
