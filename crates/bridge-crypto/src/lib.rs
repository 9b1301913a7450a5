//! Bridge Crypto: X25519 key agreement, session HMAC, and join tokens.
//!
//! Derives a per-peer shared key via X25519 during the handshake and uses
//! it only to key an HMAC-SHA256 session MAC over protocol envelopes.
//! There is no bulk payload encryption here (see `DESIGN.md` for what was
//! dropped and why).

pub mod keys;
pub mod mac;
pub mod token;

pub use keys::{KeyAgreement, PUBLIC_KEY_LEN};
pub use mac::{compute_mac, verify_mac};
pub use token::{mint_join_token, verify_join_token, TokenError, TokenPayload};
