//! Per-peer record: connection state, handshake progress, capabilities.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Discovered,
    HelloReceived,
    Ready,
    Rejected,
}

/// Public, cloneable summary of a peer's state. The real `PeerRecord` kept
/// by `bridge-core` additionally holds the derived shared key, which is
/// never surfaced through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub uuid: String,
    pub stream_id: Option<String>,
    pub connected: bool,
    pub last_seen_ms: i64,
    pub last_heartbeat_ms: Option<i64>,
    pub handshake_state: HandshakeState,
    pub auth_ok: bool,
    pub rejected_reason: Option<String>,
    pub shared_key_ready: bool,
    pub capabilities: Vec<String>,
}
