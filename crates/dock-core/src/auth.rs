use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compares a presented agent token with the configured one without leaking
/// timing. Both sides are hashed first so the comparison never depends on the
/// secret's length. An empty expected token rejects everything.
pub fn token_matches(expected: &str, provided: &str) -> bool {
    if expected.is_empty() || provided.is_empty() {
        return false;
    }
    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected.as_slice().ct_eq(provided.as_slice()).into()
}
