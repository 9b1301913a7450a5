//! `BridgeSession`: the lifecycle state machine (idle → starting →
//! connecting → connected → reconnecting → stopped), the heartbeat/reconnect
//! timers, and inbound routing between the transport event stream and the
//! handshake/file/state engines.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bridge_transport::{DataPayload, PeerTransport, TransportEvent};
use bridge_types::{BridgeEvent, Envelope, EnvelopeKind, PeerRecord, SessionConfig, TransferDirection};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::event_queue::EventQueue;
use crate::file_transfer::FileTransferEngine;
use crate::handshake::HandshakeEngine;
use crate::peer_table::PeerTable;
use crate::protocol_bus::ProtocolEventBus;
use crate::state_engine::StateEngine;
use crate::time::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Starting,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Outcome of [`BridgeSession::send`]: whether a frame actually went out and
/// which peer uuid the target ultimately resolved to (`None` for a
/// broadcast, e.g. target `null` with zero connected peers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutcome {
    pub ok: bool,
    pub used_target: Option<String>,
}

struct ResolvedTarget {
    uuid: Option<String>,
    allow_no_channel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub room: String,
    pub stream_id: String,
    pub reconnect_count: u32,
    pub peers: Vec<PeerRecord>,
}

/// Every fourth heartbeat also re-sends `sync.hello` to recover from a hello
/// dropped before the peer table learned of us.
const REHELLO_EVERY_N_HEARTBEATS: u64 = 4;

pub struct BridgeSession {
    pub session_id: String,
    config: Arc<SessionConfig>,
    transport: Arc<dyn PeerTransport>,
    peers: Arc<PeerTable>,
    events: Arc<EventQueue>,
    bus: Arc<ProtocolEventBus>,
    pub handshake: Arc<HandshakeEngine>,
    pub files: Arc<FileTransferEngine>,
    pub state: Arc<StateEngine>,
    status: RwLock<SessionStatus>,
    reconnect_count: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeSession {
    pub fn new(session_id: String, config: SessionConfig, transport: Arc<dyn PeerTransport>, capabilities: Vec<String>) -> Arc<Self> {
        let config = Arc::new(config);
        let events = Arc::new(EventQueue::new(config.event_queue_cap));
        let bus = Arc::new(ProtocolEventBus::new());
        let peers = Arc::new(PeerTable::new());
        let state = Arc::new(StateEngine::new(config.clone(), transport.clone(), events.clone(), config.stream_id.clone()));
        let handshake = Arc::new(HandshakeEngine::new(
            config.clone(),
            capabilities,
            peers.clone(),
            events.clone(),
            transport.clone(),
            state.clone(),
        ));
        let files = Arc::new(FileTransferEngine::new(config.clone(), transport.clone(), events.clone(), bus.clone()));

        Arc::new(Self {
            session_id,
            config,
            transport,
            peers,
            events,
            bus,
            handshake,
            files,
            state,
            status: RwLock::new(SessionStatus::Idle),
            reconnect_count: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.events
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            status: self.status().await,
            room: self.config.room.clone(),
            stream_id: self.config.stream_id.clone(),
            reconnect_count: self.reconnect_count.load(Ordering::SeqCst),
            peers: self.peers.list().await,
        }
    }

    async fn set_status(&self, status: SessionStatus) {
        *self.status.write().await = status;
    }

    pub async fn start(self: &Arc<Self>) -> BridgeResult<()> {
        self.set_status(SessionStatus::Starting).await;

        let dispatch = self.clone();
        let mut rx = self.transport.subscribe();
        let dispatch_handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => dispatch.handle_transport_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "transport event subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().await.push(dispatch_handle);

        self.set_status(SessionStatus::Connecting).await;
        if let Err(e) = self.connect_sequence().await {
            self.events.push(BridgeEvent::ConnectError { ts: now_ms(), reason: e.to_string() });
            self.spawn_reconnect_loop();
            return Err(e);
        }

        self.set_status(SessionStatus::Connected).await;
        self.events.push(BridgeEvent::Ready { ts: now_ms() });
        self.spawn_heartbeat_loop();
        Ok(())
    }

    async fn connect_sequence(&self) -> BridgeResult<()> {
        self.transport.connect().await?;
        self.transport
            .join_room(&self.config.room, self.config.signalling_password.as_deref())
            .await?;
        self.transport
            .announce(&self.config.stream_id, self.config.label.as_deref())
            .await?;
        if let Some(target) = &self.config.target_stream_id {
            self.transport.view(target).await?;
        }
        Ok(())
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick: u64 = 0;
            let mut interval = tokio::time::interval(Duration::from_millis(this.config.heartbeat_ms));
            loop {
                interval.tick().await;
                if this.status().await == SessionStatus::Stopped {
                    break;
                }
                tick += 1;
                if this.transport.has_open_data_channel(None) {
                    this.send_keepalive(tick).await;
                    this.handshake.send_heartbeat(tick).await;
                }
                for peer in this.peers.list().await {
                    if peer.connected {
                        let _ = this.transport.send_ping(&peer.uuid).await;
                    }
                }
                if tick % REHELLO_EVERY_N_HEARTBEATS == 0 {
                    for peer in this.peers.list().await {
                        if !peer.auth_ok {
                            this.handshake.greet(&peer.uuid).await;
                        }
                    }
                }
            }
        });
        let this = self.clone();
        tokio::spawn(async move {
            this.tasks.lock().await.push(handle);
        });
    }

    /// Application-level keepalive sent alongside `sync.heartbeat`; plain
    /// JSON rather than a protocol envelope, so a peer with no envelope
    /// support still sees liveness traffic.
    async fn send_keepalive(&self, tick: u64) {
        let payload = serde_json::json!({ "type": "keepalive", "seq": tick, "ts": now_ms() });
        let _ = self.transport.send_data(&payload, None).await;
    }

    fn spawn_reconnect_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.set_status(SessionStatus::Reconnecting).await;
            let mut attempt: u32 = 0;
            loop {
                if this.status().await == SessionStatus::Stopped {
                    return;
                }
                attempt += 1;
                this.reconnect_count.fetch_add(1, Ordering::SeqCst);
                let delay_ms = (this.config.reconnect_ms.saturating_mul(1u64 << (attempt - 1).min(20)))
                    .min(this.config.max_reconnect_ms);
                this.events.push(BridgeEvent::Reconnecting { ts: now_ms(), attempt, delay_ms });
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                if this.status().await == SessionStatus::Stopped {
                    return;
                }
                match this.connect_sequence().await {
                    Ok(()) => {
                        this.set_status(SessionStatus::Connected).await;
                        this.events.push(BridgeEvent::Ready { ts: now_ms() });
                        return;
                    }
                    Err(e) => {
                        this.events.push(BridgeEvent::ConnectError { ts: now_ms(), reason: e.to_string() });
                    }
                }
            }
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {}
            TransportEvent::Disconnected => {
                self.events.push(BridgeEvent::Disconnected {
                    ts: now_ms(),
                    reason: "transport disconnected".to_string(),
                });
                if self.status().await != SessionStatus::Stopped {
                    self.spawn_reconnect_loop();
                }
            }
            TransportEvent::ConnectionFailed { detail } => {
                self.events.push(BridgeEvent::Disconnected { ts: now_ms(), reason: detail });
                if self.status().await != SessionStatus::Stopped {
                    self.spawn_reconnect_loop();
                }
            }
            TransportEvent::Error { detail } => {
                self.events.push(BridgeEvent::TransportError { ts: now_ms(), detail });
            }
            TransportEvent::PeerConnected { uuid, stream_id } => {
                self.peers.get_or_insert(&uuid, now_ms()).await;
                self.peers
                    .mutate(&uuid, |p| {
                        p.stream_id = stream_id.clone();
                        p.connected = true;
                        p.last_seen_ms = now_ms();
                    })
                    .await;
                self.events.push(BridgeEvent::PeerConnected { ts: now_ms(), uuid: uuid.clone(), stream_id });
                self.handshake.greet(&uuid).await;
            }
            TransportEvent::PeerDisconnected { uuid, stream_id } => {
                self.peers.mark_disconnected(&uuid).await;
                self.events.push(BridgeEvent::PeerDisconnected { ts: now_ms(), uuid, stream_id });
            }
            TransportEvent::DataChannelOpen { uuid, .. } => {
                self.events.push(BridgeEvent::DataChannelOpen { ts: now_ms(), uuid });
            }
            TransportEvent::DataChannelClose { uuid, .. } => {
                self.events.push(BridgeEvent::DataChannelClose { ts: now_ms(), uuid });
            }
            TransportEvent::DataReceived { uuid, stream_id, data, .. } => {
                self.handle_data_received(uuid, stream_id, data).await;
            }
        }
    }

    async fn handle_data_received(self: &Arc<Self>, uuid: String, stream_id: Option<String>, data: DataPayload) {
        let value = match data {
            DataPayload::Json(v) => v,
            DataPayload::Bytes(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(v) => v,
                Err(_) => serde_json::json!({ "base64": BASE64.encode(&bytes) }),
            },
        };

        if !Envelope::looks_like_envelope(&value) {
            self.events.push(BridgeEvent::DataReceived { ts: now_ms(), uuid, stream_id, data: value });
            return;
        }

        let env: Envelope = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(e) => {
                warn!(peer = %uuid, error = %e, "malformed envelope, dropping");
                return;
            }
        };

        if !env.kind.is_sync() {
            if self.config.require_session_mac {
                let shared_key = self.peers.shared_key(&uuid).await;
                let ok = match (&shared_key, &env.mac) {
                    (Some(key), Some(mac)) => {
                        bridge_crypto::verify_mac(key, &bridge_types::canonical_mac_bytes(&env), mac)
                    }
                    _ => false,
                };
                if !ok {
                    self.events.push(BridgeEvent::ProtocolAuthFailed {
                        ts: now_ms(),
                        uuid,
                        kind: env.kind.wire_str().to_string(),
                        reason: "missing or invalid session MAC".to_string(),
                    });
                    return;
                }
            }
        }

        self.route_envelope(&uuid, stream_id.as_deref(), env).await;
    }

    async fn route_envelope(self: &Arc<Self>, uuid: &str, stream_id: Option<&str>, env: Envelope) {
        debug!(peer = uuid, kind = env.kind.wire_str(), "routing envelope");
        match env.kind {
            EnvelopeKind::SyncHello => self.handshake.handle_hello(uuid, &env).await,
            EnvelopeKind::SyncHelloAck => self.handshake.handle_hello_ack(uuid, &env).await,
            EnvelopeKind::SyncHeartbeat => self.handshake.handle_heartbeat(uuid, &env).await,
            EnvelopeKind::SyncReject => self.handshake.handle_reject(uuid, &env).await,

            EnvelopeKind::FileOffer => {
                self.bus.publish(env.clone());
                self.files.handle_file_offer(uuid, stream_id, &env).await;
            }
            EnvelopeKind::FileChunk => {
                self.bus.publish(env.clone());
                self.files.handle_file_chunk(uuid, &env).await;
            }
            EnvelopeKind::FileComplete => {
                self.bus.publish(env.clone());
                self.files.handle_file_complete(uuid, &env).await;
            }
            EnvelopeKind::FileResumeReq => {
                self.bus.publish(env.clone());
                self.files.handle_resume_req(uuid, &env).await;
            }
            EnvelopeKind::FileCancel => {
                self.bus.publish(env.clone());
                self.files.handle_file_cancel(uuid, &env).await;
            }
            EnvelopeKind::FileAccept
            | EnvelopeKind::FileAck
            | EnvelopeKind::FileNack
            | EnvelopeKind::FileCompleteAck
            | EnvelopeKind::FileResumeState => {
                self.bus.publish(env);
            }

            EnvelopeKind::StatePatch => self.state.handle_patch(&env).await,
            EnvelopeKind::StateSnapshotReq => self.state.handle_snapshot_request(uuid).await,
            EnvelopeKind::StateSnapshot => self.state.handle_snapshot(&env).await,
        }
    }

    /// Send an opaque application payload (not a protocol envelope) to one
    /// peer, or broadcast to all when `target` resolves to `None`. `target`
    /// may be a peer uuid, a peer's stream id, an object `{uuid, ...}`
    /// (optionally `allow_no_channel: true` to skip the open-channel check),
    /// or `null`/absent meaning "the sole connected peer".
    pub async fn send(&self, payload: serde_json::Value, target: Option<serde_json::Value>) -> BridgeResult<SendOutcome> {
        if self.status().await != SessionStatus::Connected {
            return Err(BridgeError::NotConnected);
        }

        let resolved = self.resolve_send_target(target).await?;

        if !resolved.allow_no_channel && !self.transport.has_open_data_channel(resolved.uuid.as_deref()) {
            let reason = match &resolved.uuid {
                Some(uuid) => format!("no open data channel to {uuid}"),
                None => "no peer has an open data channel".to_string(),
            };
            self.events.push(BridgeEvent::SendRejected { ts: now_ms(), reason });
            return Ok(SendOutcome { ok: false, used_target: resolved.uuid });
        }

        match self.transport.send_data(&payload, resolved.uuid.as_deref()).await {
            Ok(sent) => Ok(SendOutcome { ok: sent, used_target: resolved.uuid }),
            Err(e) => {
                self.events.push(BridgeEvent::SendError { ts: now_ms(), reason: e.to_string() });
                Err(e.into())
            }
        }
    }

    async fn resolve_send_target(&self, target: Option<serde_json::Value>) -> BridgeResult<ResolvedTarget> {
        match target {
            None | Some(serde_json::Value::Null) => {
                let connected: Vec<_> = self.peers.list().await.into_iter().filter(|p| p.connected).collect();
                match connected.len() {
                    0 => Ok(ResolvedTarget { uuid: None, allow_no_channel: false }),
                    1 => Ok(ResolvedTarget { uuid: Some(connected[0].uuid.clone()), allow_no_channel: false }),
                    n => Err(BridgeError::InvalidArgument(format!(
                        "target is ambiguous: {n} peers connected, specify one"
                    ))),
                }
            }
            Some(serde_json::Value::String(s)) => self.resolve_target_string(&s).await,
            Some(serde_json::Value::Object(map)) => {
                let uuid = map
                    .get("uuid")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| BridgeError::InvalidArgument("target object must include `uuid`".into()))?;
                let allow_no_channel = map
                    .get("allow_no_channel")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                Ok(ResolvedTarget { uuid: Some(uuid.to_string()), allow_no_channel })
            }
            Some(_) => Err(BridgeError::InvalidArgument("malformed target".into())),
        }
    }

    async fn resolve_target_string(&self, s: &str) -> BridgeResult<ResolvedTarget> {
        if self.peers.get(s).await.is_some() {
            return Ok(ResolvedTarget { uuid: Some(s.to_string()), allow_no_channel: false });
        }
        for peer in self.peers.list().await {
            if peer.stream_id.as_deref() == Some(s) {
                return Ok(ResolvedTarget { uuid: Some(peer.uuid), allow_no_channel: false });
            }
        }
        Err(BridgeError::InvalidArgument(format!("unknown peer target `{s}`")))
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.peers.list().await
    }

    pub async fn transfers(&self, direction: TransferDirection) -> (
        Vec<bridge_types::OutgoingTransferSummary>,
        Vec<bridge_types::IncomingTransferSummary>,
    ) {
        self.files.list_transfers(direction).await
    }

    pub async fn stop(self: &Arc<Self>) -> BridgeResult<()> {
        self.set_status(SessionStatus::Stopped).await;
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.transport.disconnect().await?;
        self.events.push(BridgeEvent::Stopped { ts: now_ms() });
        info!(session = %self.session_id, "session stopped");
        Ok(())
    }
}
