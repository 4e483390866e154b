//! Elligator2 representatives for Curve25519 public keys.
//!
//! An X25519 public key is a Montgomery u-coordinate, and u-coordinates are
//! easy to tell apart from random bytes. Elligator2 maps roughly half of
//! them to 254-bit strings that are uniformly distributed; the two spare
//! high bits are filled with randomness so all 32 bytes look uniform.
//!
//! # Map
//!
//! ```text
//! decode(r):  w = -A / (1 + 2r^2)
//!             u = w            if w^3 + A w^2 + w is square
//!             u = -w - A       otherwise
//!
//! encode(u):  requires u != 0, u != -A, -2u(u + A) square
//!             r^2 = -(u + A) / (2u)     (branch 0)
//!             r^2 = -u / (2(u + A))     (branch 1)
//!             r   = the root in [0, (p-1)/2]
//! ```
//!
//! Both branches decode to the same `u`; the encoder picks one at random so
//! the representatives do not all land on one side of the Legendre test.
//!
//! # Torsion
//!
//! X25519 public keys are multiples of the base point, so they all sit in
//! the prime-order subgroup, while decoding random strings lands there only
//! one time in eight. Keys are therefore encoded "dirty": a random point of
//! the 8-torsion subgroup is added first. Clamped X25519 scalars are
//! multiples of 8, so the extra component vanishes from every shared
//! secret; [`clear_torsion`] recovers the clean key when identity matters.

use crypto_bigint::subtle::{ConstantTimeEq, ConstantTimeGreater};
use crypto_bigint::{Encoding, U256};
use curve25519_dalek::constants::EIGHT_TORSION;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use x25519_dalek::PublicKey;

use crate::error::EncodingError;

/// Representative length in bytes.
pub const REPRESENTATIVE_LEN: usize = 32;

/// High bits of byte 31 that carry randomness rather than `r`.
const TWEAK_MASK: u8 = 0xc0;

mod field {
    use crypto_bigint::modular::constant_mod::Residue;
    use crypto_bigint::{impl_modulus, U256};

    impl_modulus!(
        Curve25519Prime,
        U256,
        "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffed"
    );

    /// An element of GF(2^255 - 19).
    pub(super) type Fe = Residue<Curve25519Prime, { U256::LIMBS }>;

    /// (p - 1) / 2: Legendre exponent and the largest canonical representative.
    pub(super) const P_MINUS_1_HALF: U256 =
        U256::from_be_hex("3ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff6");
    /// (p + 3) / 8: square root candidate exponent.
    pub(super) const P_PLUS_3_EIGHTH: U256 =
        U256::from_be_hex("0ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffe");
    /// (p - 1) / 4: 2^((p-1)/4) is a square root of -1.
    pub(super) const P_MINUS_1_QUARTER: U256 =
        U256::from_be_hex("1ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffb");

    /// Curve25519 Montgomery coefficient A.
    pub(super) const MONTGOMERY_A: Fe = Fe::new(&U256::from_u64(486_662));
    pub(super) const TWO: Fe = Fe::new(&U256::from_u64(2));
}

use field::{Fe, MONTGOMERY_A, P_MINUS_1_HALF, P_MINUS_1_QUARTER, P_PLUS_3_EIGHTH, TWO};

/// Loads 255 bits, ignoring the top bit of byte 31.
fn fe_from_bytes(bytes: &[u8; 32]) -> Fe {
    let mut masked = *bytes;
    masked[31] &= 0x7f;
    Fe::new(&U256::from_le_bytes(masked))
}

fn fe_to_bytes(x: &Fe) -> [u8; 32] {
    x.retrieve().to_le_bytes()
}

fn is_zero(x: &Fe) -> bool {
    x.ct_eq(&Fe::ZERO).into()
}

/// Zero counts as a square.
fn is_square(x: &Fe) -> bool {
    let chi = x.pow(&P_MINUS_1_HALF);
    (chi.ct_eq(&Fe::ONE) | x.ct_eq(&Fe::ZERO)).into()
}

/// Some square root of `x`, or `None` for non-squares.
fn sqrt(x: &Fe) -> Option<Fe> {
    let candidate = x.pow(&P_PLUS_3_EIGHTH);
    let check = candidate.square();
    if bool::from(check.ct_eq(x)) {
        return Some(candidate);
    }
    if bool::from(check.ct_eq(&x.neg())) {
        let sqrt_m1 = TWO.pow(&P_MINUS_1_QUARTER);
        return Some(candidate.mul(&sqrt_m1));
    }
    None
}

/// Callers only invert values already known to be non-zero.
fn invert(x: &Fe) -> Fe {
    x.invert().0
}

fn is_high(x: &Fe) -> bool {
    x.retrieve().ct_gt(&P_MINUS_1_HALF).into()
}

/// Whether `public` has an Elligator2 representative.
pub fn is_encodable(public: &PublicKey) -> bool {
    let u = fe_from_bytes(public.as_bytes());
    let u_plus_a = u.add(&MONTGOMERY_A);
    if is_zero(&u) || is_zero(&u_plus_a) {
        return false;
    }
    is_square(&TWO.mul(&u).mul(&u_plus_a).neg())
}

/// Encode the u-coordinate `public` exactly as given.
///
/// `tweak` supplies the randomness: bit 0 selects the branch, bits 6 and 7
/// become the top two bits of the output. Use [`encode_with_torsion`] for
/// keys that go on the wire.
pub fn encode(public: &PublicKey, tweak: u8) -> Result<[u8; 32], EncodingError> {
    if !is_encodable(public) {
        return Err(EncodingError::NotEncodable);
    }

    let u = fe_from_bytes(public.as_bytes());
    let u_plus_a = u.add(&MONTGOMERY_A);

    let r_squared = if tweak & 1 == 0 {
        u_plus_a.neg().mul(&invert(&TWO.mul(&u)))
    } else {
        u.neg().mul(&invert(&TWO.mul(&u_plus_a)))
    };

    let mut r = sqrt(&r_squared).ok_or(EncodingError::NotEncodable)?;
    if is_high(&r) {
        r = r.neg();
    }

    let mut out = fe_to_bytes(&r);
    out[31] |= tweak & TWEAK_MASK;
    Ok(out)
}

/// Add the `torsion`-th 8-torsion point (mod 8) to `public`, then encode.
pub fn encode_with_torsion(
    public: &PublicKey,
    torsion: u8,
    tweak: u8,
) -> Result<[u8; 32], EncodingError> {
    encode(&add_torsion(public, torsion)?, tweak)
}

/// Decode a representative to the u-coordinate it encodes, torsion
/// component included.
///
/// Rejects wrong lengths and representatives above (p - 1) / 2. Never
/// panics on arbitrary input.
pub fn decode(bytes: &[u8]) -> Result<PublicKey, EncodingError> {
    let mut r_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EncodingError::InvalidLength(bytes.len()))?;
    r_bytes[31] &= !TWEAK_MASK;

    let canonical = U256::from_le_bytes(r_bytes);
    if bool::from(canonical.ct_gt(&P_MINUS_1_HALF)) {
        return Err(EncodingError::NonCanonical);
    }

    let r = Fe::new(&canonical);
    let a = MONTGOMERY_A;

    // 1 + 2r^2 is never zero: -1/2 is not a square mod p.
    let denom = Fe::ONE.add(&TWO.mul(&r.square()));
    let w = a.neg().mul(&invert(&denom));

    let w_squared = w.square();
    let curve = w_squared.mul(&w).add(&a.mul(&w_squared)).add(&w);

    let u = if is_square(&curve) { w } else { w.neg().sub(&a) };
    Ok(PublicKey::from(fe_to_bytes(&u)))
}

/// `public` plus one of the eight small-order points.
pub fn add_torsion(public: &PublicKey, torsion: u8) -> Result<PublicKey, EncodingError> {
    let point = MontgomeryPoint(public.to_bytes())
        .to_edwards(0)
        .ok_or(EncodingError::InvalidPoint)?;
    let dirty = point + EIGHT_TORSION[usize::from(torsion & 7)];
    Ok(PublicKey::from(dirty.to_montgomery().to_bytes()))
}

/// The prime-order component of `public`.
///
/// Multiplying by 8 kills the torsion part; multiplying by 8^-1 mod l then
/// restores the prime-order point.
pub fn clear_torsion(public: &PublicKey) -> Result<PublicKey, EncodingError> {
    let point = MontgomeryPoint(public.to_bytes())
        .to_edwards(0)
        .ok_or(EncodingError::InvalidPoint)?;
    let clean = point.mul_by_cofactor() * Scalar::from(8u8).invert();
    Ok(PublicKey::from(clean.to_montgomery().to_bytes()))
}

/// Whether some dirty variant of `public` is encodable.
pub fn has_encoding(public: &PublicKey) -> bool {
    (0..8u8).any(|torsion| add_torsion(public, torsion).is_ok_and(|dirty| is_encodable(&dirty)))
}
