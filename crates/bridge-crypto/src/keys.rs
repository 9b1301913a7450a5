//! X25519 key agreement, run as part of peer admission.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

pub const PUBLIC_KEY_LEN: usize = 32;

/// DER encoding of the X25519 `AlgorithmIdentifier` (OID `1.3.101.110`, no
/// parameters) plus the fixed `SubjectPublicKeyInfo` wrapper around a
/// 32-byte BIT STRING. X25519 keys are always 32 bytes, so this prefix is
/// constant and a full ASN.1 writer is unnecessary.
const SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, // SEQUENCE, 42 bytes follow
    0x30, 0x05, // SEQUENCE (AlgorithmIdentifier), 5 bytes follow
    0x06, 0x03, 0x2b, 0x65, 0x6e, // OID 1.3.101.110 (X25519)
    0x03, 0x21, 0x00, // BIT STRING, 33 bytes, 0 unused bits
];

/// Holds this side's X25519 static secret for the lifetime of a session.
/// `StaticSecret` (unlike `EphemeralSecret`) can run Diffie-Hellman with
/// more than one remote key, which a multi-peer room requires.
pub struct KeyAgreement {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyAgreement {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Base64 (standard alphabet) encoding of the local public key wrapped
    /// in a DER/SPKI envelope, as advertised in `sync.hello`/`sync.hello_ack`
    /// payloads.
    pub fn public_key_b64(&self) -> String {
        let mut der = Vec::with_capacity(SPKI_PREFIX.len() + PUBLIC_KEY_LEN);
        der.extend_from_slice(&SPKI_PREFIX);
        der.extend_from_slice(self.public.as_bytes());
        BASE64.encode(der)
    }

    /// Derive the shared key with a peer's base64-encoded, DER/SPKI-wrapped
    /// public key.
    pub fn derive_shared_key(&self, remote_public_b64: &str) -> Result<[u8; 32], KeyError> {
        let der = BASE64
            .decode(remote_public_b64)
            .map_err(|_| KeyError::InvalidEncoding)?;
        let raw = der.strip_prefix(&SPKI_PREFIX[..]).ok_or(KeyError::InvalidEncoding)?;
        let arr: [u8; PUBLIC_KEY_LEN] = raw
            .try_into()
            .map_err(|_| KeyError::InvalidLength)?;
        let remote_public = PublicKey::from(arr);
        let shared = self.secret.diffie_hellman(&remote_public);
        Ok(*shared.as_bytes())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("public key is not valid base64")]
    InvalidEncoding,
    #[error("public key must be exactly 32 bytes")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_keys_derive_identical_shared_secret() {
        let a = KeyAgreement::generate();
        let b = KeyAgreement::generate();

        let shared_a = a.derive_shared_key(&b.public_key_b64()).unwrap();
        let shared_b = b.derive_shared_key(&a.public_key_b64()).unwrap();

        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn rejects_malformed_public_key() {
        let a = KeyAgreement::generate();
        assert!(a.derive_shared_key("not-base64!!").is_err());
        assert!(a.derive_shared_key(&base64::engine::general_purpose::STANDARD.encode([0u8; 4])).is_err());
    }
}
