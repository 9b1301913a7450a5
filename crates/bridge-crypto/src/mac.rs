//! Session MAC over the canonical envelope bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// `hex(HMAC-SHA256(shared_key, canonical_bytes))`.
pub fn compute_mac(shared_key: &[u8; 32], canonical_bytes: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(shared_key).expect("HMAC accepts any key length");
    mac.update(canonical_bytes);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex-encoded MAC against freshly computed bytes.
pub fn verify_mac(shared_key: &[u8; 32], canonical_bytes: &[u8], candidate_hex: &str) -> bool {
    let expected = compute_mac(shared_key, canonical_bytes);
    // Compare as bytes, not as hex-decoded values, to avoid rejecting on
    // decode errors and to keep the comparison itself constant time.
    expected.as_bytes().ct_eq(candidate_hex.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_own_mac() {
        let key = [7u8; 32];
        let bytes = b"canonical-envelope";
        let mac = compute_mac(&key, bytes);
        assert!(verify_mac(&key, bytes, &mac));
    }

    #[test]
    fn rejects_wrong_key() {
        let key = [7u8; 32];
        let other = [9u8; 32];
        let bytes = b"canonical-envelope";
        let mac = compute_mac(&key, bytes);
        assert!(!verify_mac(&other, bytes, &mac));
    }

    #[test]
    fn rejects_tampered_bytes() {
        let key = [7u8; 32];
        let mac = compute_mac(&key, b"original");
        assert!(!verify_mac(&key, b"tampered", &mac));
    }
}
