//! The `PeerTransport` contract and a deterministic in-process
//! implementation (`FakeTransport`) used by `bridge-core`'s end-to-end
//! tests. A production build pairs [`PeerTransport`] with a real WebRTC SDK
//! adapter; that adapter is an external collaborator out of scope for this
//! crate.
//!
//! Grounded on `haven-gateway`'s `Dispatcher` (broadcast channel fanning out
//! events to subscribers, per-peer `mpsc` channels for targeted sends) and
//! `haven-gateway::connection` (the split sender/receiver WebSocket loop),
//! adapted from "one process, many WebSocket clients" to "one process per
//! peer, data-channel events."

pub mod events;
pub mod fake;

pub use events::{DataPayload, TransportEvent};

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("transport error: {0}")]
    Other(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Adapter over a WebRTC SDK. Implementations own the signalling
/// connection and per-peer data channels; `BridgeSession` only ever talks to
/// this trait, never to a concrete SDK type.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(&self) -> TransportResult<()>;
    async fn join_room(&self, room: &str, password: Option<&str>) -> TransportResult<()>;
    async fn announce(&self, stream_id: &str, label: Option<&str>) -> TransportResult<()>;
    async fn view(&self, target_stream_id: &str) -> TransportResult<()>;
    async fn disconnect(&self) -> TransportResult<()>;

    /// Send `payload` to `target` (a peer uuid), or broadcast to every
    /// connected peer when `target` is `None`. Returns whether at least one
    /// frame was actually sent.
    async fn send_data(&self, payload: &Value, target: Option<&str>) -> TransportResult<bool>;

    /// Best-effort transport-level ping; failures are not fatal.
    async fn send_ping(&self, uuid: &str) -> TransportResult<()>;

    /// True iff at least one data channel to `uuid` (or any peer, when `None`)
    /// is open.
    fn has_open_data_channel(&self, uuid: Option<&str>) -> bool;

    /// Subscribe to this transport's event stream. Each call yields an
    /// independent receiver; events published before subscribing are lost,
    /// matching a broadcast channel's semantics.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent>;
}
