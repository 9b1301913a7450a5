//! User-visible events surfaced by the [`EventQueue`].
//!
//! Mirrors the tagged-enum shape `haven-types::events::GatewayEvent` uses for
//! its gateway events, but every variant here carries its own `ts` since the
//! queue is polled rather than pushed over a socket.

use serde::{Deserialize, Serialize};

use crate::peer::HandshakeState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Session finished `start()` successfully.
    Ready { ts: i64 },
    /// `start()` failed; a reconnect has been scheduled.
    ConnectError { ts: i64, reason: String },
    /// Transport reported `disconnected` or `connectionFailed`.
    Disconnected { ts: i64, reason: String },
    /// A reconnect attempt is about to run.
    Reconnecting { ts: i64, attempt: u32, delay_ms: u64 },
    /// `stop()` completed.
    Stopped { ts: i64 },

    PeerConnected { ts: i64, uuid: String, stream_id: Option<String> },
    PeerDisconnected { ts: i64, uuid: String, stream_id: Option<String> },
    DataChannelOpen { ts: i64, uuid: String },
    DataChannelClose { ts: i64, uuid: String },

    /// Non-envelope payload surfaced verbatim.
    DataReceived {
        ts: i64,
        uuid: String,
        stream_id: Option<String>,
        /// Base64 when the transport delivered raw bytes; otherwise the
        /// structured object re-serialized to JSON text.
        data: serde_json::Value,
    },

    SendRejected { ts: i64, reason: String },
    SendError { ts: i64, reason: String },

    SyncPeerUpdated {
        ts: i64,
        uuid: String,
        stream_id: Option<String>,
        handshake_state: HandshakeState,
        auth_ok: bool,
    },
    SyncPeerRejected { ts: i64, uuid: String, reason: String },
    ProtocolAuthFailed { ts: i64, uuid: String, kind: String, reason: String },

    FileReceived { ts: i64, transfer_id: String, from_uuid: String, total_bytes: u64 },
    FileTransferCancelled { ts: i64, transfer_id: String },
    FileTransferFailed { ts: i64, transfer_id: String, reason: String },

    StateUpdated { ts: i64, key: String, source: String },

    TransportError { ts: i64, detail: String },
}

impl BridgeEvent {
    pub fn ts(&self) -> i64 {
        match self {
            BridgeEvent::Ready { ts }
            | BridgeEvent::ConnectError { ts, .. }
            | BridgeEvent::Disconnected { ts, .. }
            | BridgeEvent::Reconnecting { ts, .. }
            | BridgeEvent::Stopped { ts }
            | BridgeEvent::PeerConnected { ts, .. }
            | BridgeEvent::PeerDisconnected { ts, .. }
            | BridgeEvent::DataChannelOpen { ts, .. }
            | BridgeEvent::DataChannelClose { ts, .. }
            | BridgeEvent::DataReceived { ts, .. }
            | BridgeEvent::SendRejected { ts, .. }
            | BridgeEvent::SendError { ts, .. }
            | BridgeEvent::SyncPeerUpdated { ts, .. }
            | BridgeEvent::SyncPeerRejected { ts, .. }
            | BridgeEvent::ProtocolAuthFailed { ts, .. }
            | BridgeEvent::FileReceived { ts, .. }
            | BridgeEvent::FileTransferCancelled { ts, .. }
            | BridgeEvent::FileTransferFailed { ts, .. }
            | BridgeEvent::StateUpdated { ts, .. }
            | BridgeEvent::TransportError { ts, .. } => *ts,
        }
    }
}
