//! On-wire protocol envelope.
//!
//! The envelope is the structured object carried inside a data-channel
//! payload that identifies a bridge-protocol message. `kind` and `payload`
//! are kept as separate fields (rather than flattening `payload` into the
//! envelope) because the session MAC is computed over the canonical
//! ordered tuple `{kind, ts, nonce, room, from_stream_id, payload}` — see
//! [`canonical_mac_bytes`]. `payload`'s shape depends on `kind`; callers
//! deserialize it into the matching typed struct with [`Envelope::decode_payload`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Constant magic string identifying a bridge protocol envelope.
pub const ENVELOPE_MAGIC: &str = "vdo_mcp_bridge_v1";

/// The discriminant carried in `Envelope::kind`. Kept as a dedicated type
/// (rather than a bare `String`) so engines match on it exhaustively, but
/// serializes to/from the dotted wire strings below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "sync.hello")]
    SyncHello,
    #[serde(rename = "sync.hello_ack")]
    SyncHelloAck,
    #[serde(rename = "sync.heartbeat")]
    SyncHeartbeat,
    #[serde(rename = "sync.reject")]
    SyncReject,
    #[serde(rename = "file.offer")]
    FileOffer,
    #[serde(rename = "file.accept")]
    FileAccept,
    #[serde(rename = "file.chunk")]
    FileChunk,
    #[serde(rename = "file.ack")]
    FileAck,
    #[serde(rename = "file.nack")]
    FileNack,
    #[serde(rename = "file.complete")]
    FileComplete,
    #[serde(rename = "file.complete_ack")]
    FileCompleteAck,
    #[serde(rename = "file.resume_req")]
    FileResumeReq,
    #[serde(rename = "file.resume_state")]
    FileResumeState,
    #[serde(rename = "file.cancel")]
    FileCancel,
    #[serde(rename = "state.patch")]
    StatePatch,
    #[serde(rename = "state.snapshot_req")]
    StateSnapshotReq,
    #[serde(rename = "state.snapshot")]
    StateSnapshot,
}

impl EnvelopeKind {
    /// Whether this kind belongs to the handshake/sync family, which is
    /// never covered by the session MAC (that applies to non-`sync.*` kinds).
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::SyncHello
                | EnvelopeKind::SyncHelloAck
                | EnvelopeKind::SyncHeartbeat
                | EnvelopeKind::SyncReject
        )
    }

    /// The exact wire string for this kind, used by canonicalization and logs.
    pub fn wire_str(&self) -> &'static str {
        match self {
            EnvelopeKind::SyncHello => "sync.hello",
            EnvelopeKind::SyncHelloAck => "sync.hello_ack",
            EnvelopeKind::SyncHeartbeat => "sync.heartbeat",
            EnvelopeKind::SyncReject => "sync.reject",
            EnvelopeKind::FileOffer => "file.offer",
            EnvelopeKind::FileAccept => "file.accept",
            EnvelopeKind::FileChunk => "file.chunk",
            EnvelopeKind::FileAck => "file.ack",
            EnvelopeKind::FileNack => "file.nack",
            EnvelopeKind::FileComplete => "file.complete",
            EnvelopeKind::FileCompleteAck => "file.complete_ack",
            EnvelopeKind::FileResumeReq => "file.resume_req",
            EnvelopeKind::FileResumeState => "file.resume_state",
            EnvelopeKind::FileCancel => "file.cancel",
            EnvelopeKind::StatePatch => "state.patch",
            EnvelopeKind::StateSnapshotReq => "state.snapshot_req",
            EnvelopeKind::StateSnapshot => "state.snapshot",
        }
    }
}

/// The envelope carried inside a data-channel payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub magic: String,
    pub kind: EnvelopeKind,
    pub ts: i64,
    pub nonce: String,
    pub room: String,
    pub from_stream_id: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl Envelope {
    /// Build an envelope with `mac` unset. Callers needing a MAC call
    /// [`Envelope::with_mac`] after computing it over [`canonical_mac_bytes`].
    pub fn new(
        kind: EnvelopeKind,
        ts: i64,
        nonce: String,
        room: impl Into<String>,
        from_stream_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            magic: ENVELOPE_MAGIC.to_string(),
            kind,
            ts,
            nonce,
            room: room.into(),
            from_stream_id: from_stream_id.into(),
            payload,
            mac: None,
        }
    }

    pub fn with_mac(mut self, mac: String) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Deserialize `self.payload` into the requested typed payload struct.
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// True if `value` looks like a bridge envelope (has the magic string
    /// and a recognized `kind`) rather than opaque application data.
    pub fn looks_like_envelope(value: &Value) -> bool {
        value
            .get("magic")
            .and_then(Value::as_str)
            .map(|m| m == ENVELOPE_MAGIC)
            .unwrap_or(false)
    }
}

/// The exact ordered JSON object the session MAC is computed over: the
/// canonical form is `{kind, ts, nonce, room, from_stream_id, payload}` in
/// that order,
/// excluding `magic` and `mac` itself. Any deviation breaks interop.
pub fn canonical_mac_bytes(env: &Envelope) -> Vec<u8> {
    let mut obj = serde_json::Map::new();
    obj.insert("kind".to_string(), Value::String(env.kind.wire_str().to_string()));
    obj.insert("ts".to_string(), Value::from(env.ts));
    obj.insert("nonce".to_string(), Value::String(env.nonce.clone()));
    obj.insert("room".to_string(), Value::String(env.room.clone()));
    obj.insert(
        "from_stream_id".to_string(),
        Value::String(env.from_stream_id.clone()),
    );
    obj.insert("payload".to_string(), env.payload.clone());
    // `serde_json::Map` is insertion-ordered by default (the `preserve_order`
    // behavior ships via the `indexmap`-free BTreeMap unless the
    // `preserve_order` feature is off; we insert in the exact required order
    // above and serialize a `Value::Object` so compact serialization keeps it).
    serde_json::to_vec(&Value::Object(obj)).expect("canonical envelope always serializes")
}

// ---------------------------------------------------------------------
// Typed payloads, one per `EnvelopeKind`.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub capabilities: Vec<String>,
    pub public_key_b64: Option<String>,
    pub join_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAckPayload {
    pub capabilities: Vec<String>,
    pub public_key_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOfferPayload {
    pub transfer_id: String,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub total_bytes: u64,
    pub total_chunks: u32,
    pub chunk_bytes: u32,
    pub file_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAcceptPayload {
    pub transfer_id: String,
    pub next_seq: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunkPayload {
    pub transfer_id: String,
    pub seq: u32,
    pub data_base64: String,
    pub chunk_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAckPayload {
    pub transfer_id: String,
    pub seq: u32,
    pub next_seq: u32,
    pub received_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNackPayload {
    pub transfer_id: String,
    pub expected_seq: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCompletePayload {
    pub transfer_id: String,
    pub total_bytes: u64,
    pub file_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCompleteAckPayload {
    pub transfer_id: String,
    pub file_hash: String,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResumeReqPayload {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResumeStatePayload {
    pub transfer_id: String,
    pub next_seq: u32,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCancelPayload {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePatchPayload {
    pub key: String,
    pub value: Value,
    pub actor: String,
    pub clock: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshotReqPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntryWire {
    pub key: String,
    pub value: Value,
    pub actor: String,
    pub clock: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshotPayload {
    pub room: String,
    pub stream_id: String,
    pub entries: Vec<StateEntryWire>,
    pub actor_clock: std::collections::BTreeMap<String, u64>,
    pub generated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_wire_string() {
        let v = serde_json::to_value(EnvelopeKind::FileResumeReq).unwrap();
        assert_eq!(v.as_str().unwrap(), "file.resume_req");
        let k: EnvelopeKind = serde_json::from_value(v).unwrap();
        assert_eq!(k.wire_str(), "file.resume_req");
    }

    #[test]
    fn canonical_bytes_are_deterministic() {
        let env = Envelope::new(
            EnvelopeKind::FileAck,
            42,
            "n1".into(),
            "room1",
            "agent_a",
            serde_json::json!({"seq": 1}),
        );
        let a = canonical_mac_bytes(&env);
        let b = canonical_mac_bytes(&env);
        assert_eq!(a, b);
        let s = String::from_utf8(a).unwrap();
        assert!(s.starts_with(r#"{"kind":"file.ack","ts":42,"nonce":"n1","room":"room1","from_stream_id":"agent_a","payload":"#));
    }
}
