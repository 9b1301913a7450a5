//! Transport-level events: connection/peer lifecycle and inbound data.

use serde_json::Value;

/// What a data channel delivered: either raw bytes or an already-decoded
/// structured object.
#[derive(Debug, Clone)]
pub enum DataPayload {
    Bytes(Vec<u8>),
    Json(Value),
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    ConnectionFailed { detail: String },
    Error { detail: String },
    PeerConnected { uuid: String, stream_id: Option<String> },
    PeerDisconnected { uuid: String, stream_id: Option<String> },
    DataChannelOpen { uuid: String, stream_id: Option<String> },
    DataChannelClose { uuid: String, stream_id: Option<String> },
    DataReceived {
        uuid: String,
        stream_id: Option<String>,
        data: DataPayload,
        /// True when this arrived over a relay/fallback path rather than the
        /// primary data channel.
        fallback: bool,
    },
}
