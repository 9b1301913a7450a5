//! Join token minting and verification.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub room: String,
    pub stream_id: String,
    pub exp: i64,
    pub nonce: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not in the expected `payload.signature` shape")]
    Malformed,
    #[error("token signature does not match")]
    BadSignature,
    #[error("token payload is not valid JSON")]
    BadPayload,
    #[error("token room does not match session room")]
    RoomMismatch,
    #[error("token stream id does not match")]
    StreamIdMismatch,
    #[error("token has expired")]
    Expired,
}

/// Mint `base64url(payload).base64url(HMAC-SHA256(secret, base64url(payload)))`.
pub fn mint_join_token(secret: &str, payload: &TokenPayload) -> String {
    let payload_json = serde_json::to_vec(payload).expect("TokenPayload always serializes");
    let payload_b64 = BASE64URL.encode(payload_json);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload_b64.as_bytes());
    let sig_b64 = BASE64URL.encode(mac.finalize().into_bytes());

    format!("{}.{}", payload_b64, sig_b64)
}

/// Verify a join token: recompute the HMAC in constant time, then check
/// room/stream-id (when the caller supplies them) and expiry.
pub fn verify_join_token(
    secret: &str,
    token: &str,
    expected_room: Option<&str>,
    expected_stream_id: Option<&str>,
    now_unix: i64,
) -> Result<TokenPayload, TokenError> {
    let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload_b64.as_bytes());
    let expected_sig_b64 = BASE64URL.encode(mac.finalize().into_bytes());

    if expected_sig_b64.as_bytes().ct_eq(sig_b64.as_bytes()).unwrap_u8() == 0 {
        return Err(TokenError::BadSignature);
    }

    let payload_bytes = BASE64URL
        .decode(payload_b64)
        .map_err(|_| TokenError::BadPayload)?;
    let payload: TokenPayload =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::BadPayload)?;

    if let Some(room) = expected_room {
        if payload.room != room {
            return Err(TokenError::RoomMismatch);
        }
    }
    if let Some(stream_id) = expected_stream_id {
        if payload.stream_id != stream_id {
            return Err(TokenError::StreamIdMismatch);
        }
    }
    if payload.exp <= now_unix {
        return Err(TokenError::Expired);
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(room: &str, stream_id: &str, exp: i64) -> TokenPayload {
        TokenPayload {
            room: room.to_string(),
            stream_id: stream_id.to_string(),
            exp,
            nonce: "abc123".to_string(),
        }
    }

    #[test]
    fn mints_and_verifies_round_trip() {
        let secret = "room-secret";
        let token = mint_join_token(secret, &payload("room1", "agent_a", 1_000_000));
        let verified = verify_join_token(secret, &token, Some("room1"), Some("agent_a"), 500_000).unwrap();
        assert_eq!(verified.room, "room1");
    }

    #[test]
    fn rejects_expired_token() {
        let secret = "room-secret";
        let token = mint_join_token(secret, &payload("room1", "agent_a", 100));
        let err = verify_join_token(secret, &token, None, None, 200).unwrap_err();
        assert_eq!(err, TokenError::Expired);
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = mint_join_token("secret-a", &payload("room1", "agent_a", 1_000_000));
        let err = verify_join_token("secret-b", &token, None, None, 0).unwrap_err();
        assert_eq!(err, TokenError::BadSignature);
    }

    #[test]
    fn rejects_room_mismatch() {
        let secret = "room-secret";
        let token = mint_join_token(secret, &payload("room1", "agent_a", 1_000_000));
        let err = verify_join_token(secret, &token, Some("room2"), None, 0).unwrap_err();
        assert_eq!(err, TokenError::RoomMismatch);
    }
}
