//! Common helper functions.

/// Constant-time comparison of two byte slices.
///
/// Length is not secret; the contents are. Used when comparing pinned
/// peer keys and other attacker-visible values.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Lowercase hex rendering of a short identifier, for logs.
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
