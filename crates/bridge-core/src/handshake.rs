//! Peer admission: `sync.hello` / `sync.hello_ack` / `sync.reject` /
//! `sync.heartbeat`. A freshly discovered peer is unauthenticated until this
//! engine derives a shared key with it and (if a join secret is configured)
//! validates its token.

use std::sync::Arc;

use bridge_transport::PeerTransport;
use bridge_types::{
    BridgeEvent, Envelope, EnvelopeKind, HandshakeState, HeartbeatPayload, HelloAckPayload,
    HelloPayload, RejectPayload, SessionConfig,
};
use tracing::{debug, warn};

use crate::event_queue::EventQueue;
use crate::peer_table::PeerTable;
use crate::state_engine::StateEngine;
use crate::time::{new_nonce, now_ms};

pub struct HandshakeEngine {
    config: Arc<SessionConfig>,
    keys: bridge_crypto::KeyAgreement,
    capabilities: Vec<String>,
    peers: Arc<PeerTable>,
    events: Arc<EventQueue>,
    transport: Arc<dyn PeerTransport>,
    state: Arc<StateEngine>,
}

impl HandshakeEngine {
    pub fn new(
        config: Arc<SessionConfig>,
        capabilities: Vec<String>,
        peers: Arc<PeerTable>,
        events: Arc<EventQueue>,
        transport: Arc<dyn PeerTransport>,
        state: Arc<StateEngine>,
    ) -> Self {
        Self {
            config,
            keys: bridge_crypto::KeyAgreement::generate(),
            capabilities,
            peers,
            events,
            transport,
            state,
        }
    }

    pub fn public_key_b64(&self) -> String {
        self.keys.public_key_b64()
    }

    fn envelope(&self, kind: EnvelopeKind, payload: serde_json::Value) -> Envelope {
        Envelope::new(
            kind,
            now_ms(),
            new_nonce(),
            self.config.room.clone(),
            self.config.stream_id.clone(),
            payload,
        )
    }

    fn local_join_token(&self) -> Option<String> {
        self.config.join_token.clone()
    }

    /// Kick off admission for a newly discovered peer by sending our `sync.hello`.
    pub async fn greet(&self, peer_uuid: &str) {
        let payload = HelloPayload {
            capabilities: self.capabilities.clone(),
            public_key_b64: Some(self.keys.public_key_b64()),
            join_token: self.local_join_token(),
        };
        let env = self.envelope(
            EnvelopeKind::SyncHello,
            serde_json::to_value(payload).expect("HelloPayload always serializes"),
        );
        if let Err(e) = self.transport.send_data(
            &serde_json::to_value(&env).expect("Envelope always serializes"),
            Some(peer_uuid),
        ).await {
            warn!(peer = peer_uuid, error = %e, "failed to send sync.hello");
        }
    }

    /// Periodic liveness ping broadcast to every connected peer.
    pub async fn send_heartbeat(&self, seq: u64) {
        let payload = HeartbeatPayload { seq };
        let env = self.envelope(
            EnvelopeKind::SyncHeartbeat,
            serde_json::to_value(payload).expect("HeartbeatPayload always serializes"),
        );
        let _ = self
            .transport
            .send_data(&serde_json::to_value(&env).expect("Envelope always serializes"), None)
            .await;
    }

    fn admit_token(&self, from_uuid: &str, token: Option<&str>) -> Result<(), String> {
        if !self.config.enforce_join_token {
            return Ok(());
        }
        let secret = match &self.config.join_token_secret {
            Some(s) => s,
            None => return Err("join token enforcement enabled with no secret configured".into()),
        };
        let token = token.ok_or_else(|| "missing join token".to_string())?;
        bridge_crypto::verify_join_token(
            secret,
            token,
            Some(&self.config.room),
            None,
            now_ms() / 1000,
        )
        .map_err(|e| e.to_string())?;
        debug!(peer = from_uuid, "join token accepted");
        Ok(())
    }

    fn admit_stream_id(&self, from_stream_id: &str) -> Result<(), String> {
        if self.config.allow_peer_stream_ids.is_empty() {
            return Ok(());
        }
        if self
            .config
            .allow_peer_stream_ids
            .iter()
            .any(|s| s == from_stream_id)
        {
            Ok(())
        } else {
            Err(format!("stream id {from_stream_id} is not on the allow list"))
        }
    }

    async fn reject(&self, peer_uuid: &str, reason: String) {
        self.peers
            .mutate(peer_uuid, |p| {
                p.handshake_state = HandshakeState::Rejected;
                p.rejected_reason = Some(reason.clone());
                p.auth_ok = false;
            })
            .await;
        let env = self.envelope(
            EnvelopeKind::SyncReject,
            serde_json::to_value(RejectPayload { reason: reason.clone() })
                .expect("RejectPayload always serializes"),
        );
        let _ = self
            .transport
            .send_data(&serde_json::to_value(&env).expect("Envelope always serializes"), Some(peer_uuid))
            .await;
        self.events.push(BridgeEvent::SyncPeerRejected {
            ts: now_ms(),
            uuid: peer_uuid.to_string(),
            reason,
        });
    }

    /// Handle an inbound `sync.hello` from `from_uuid`.
    pub async fn handle_hello(&self, from_uuid: &str, env: &Envelope) {
        let payload: HelloPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = from_uuid, error = %e, "malformed sync.hello payload");
                return;
            }
        };

        if let Err(reason) = self.admit_stream_id(&env.from_stream_id) {
            self.reject(from_uuid, reason).await;
            return;
        }
        if let Err(reason) = self.admit_token(from_uuid, payload.join_token.as_deref()) {
            self.reject(from_uuid, reason).await;
            return;
        }

        let shared_key = match &payload.public_key_b64 {
            Some(pk) => match self.keys.derive_shared_key(pk) {
                Ok(k) => Some(k),
                Err(e) => {
                    self.reject(from_uuid, format!("invalid public key: {e}")).await;
                    return;
                }
            },
            None => None,
        };

        self.peers
            .mutate(from_uuid, |p| {
                p.stream_id = Some(env.from_stream_id.clone());
                p.handshake_state = HandshakeState::HelloReceived;
                p.capabilities = payload.capabilities.clone();
                p.remote_public_key_b64 = payload.public_key_b64.clone();
                p.shared_key = shared_key;
                p.auth_ok = shared_key.is_some() || !self.config.require_session_mac;
                p.last_seen_ms = now_ms();
                if p.auth_ok {
                    p.handshake_state = HandshakeState::Ready;
                }
            })
            .await;

        let ack = HelloAckPayload {
            capabilities: self.capabilities.clone(),
            public_key_b64: Some(self.keys.public_key_b64()),
        };
        let env_out = self.envelope(
            EnvelopeKind::SyncHelloAck,
            serde_json::to_value(ack).expect("HelloAckPayload always serializes"),
        );
        let _ = self
            .transport
            .send_data(&serde_json::to_value(&env_out).expect("Envelope always serializes"), Some(from_uuid))
            .await;

        self.emit_sync_update(from_uuid).await;
        self.state.request_snapshot_from(from_uuid).await;
    }

    pub async fn handle_hello_ack(&self, from_uuid: &str, env: &Envelope) {
        let payload: HelloAckPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = from_uuid, error = %e, "malformed sync.hello_ack payload");
                return;
            }
        };

        let shared_key = match &payload.public_key_b64 {
            Some(pk) => self.keys.derive_shared_key(pk).ok(),
            None => None,
        };

        self.peers
            .mutate(from_uuid, |p| {
                p.capabilities = payload.capabilities.clone();
                p.remote_public_key_b64 = payload.public_key_b64.clone();
                p.shared_key = shared_key;
                p.auth_ok = shared_key.is_some() || !self.config.require_session_mac;
                p.last_seen_ms = now_ms();
                if p.auth_ok {
                    p.handshake_state = HandshakeState::Ready;
                }
            })
            .await;

        self.emit_sync_update(from_uuid).await;
        self.state.request_snapshot_from(from_uuid).await;
    }

    pub async fn handle_reject(&self, from_uuid: &str, env: &Envelope) {
        let payload: RejectPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(_) => RejectPayload { reason: "rejected".into() },
        };
        self.peers
            .mutate(from_uuid, |p| {
                p.handshake_state = HandshakeState::Rejected;
                p.auth_ok = false;
                p.rejected_reason = Some(payload.reason.clone());
            })
            .await;
        self.events.push(BridgeEvent::SyncPeerRejected {
            ts: now_ms(),
            uuid: from_uuid.to_string(),
            reason: payload.reason,
        });
    }

    pub async fn handle_heartbeat(&self, from_uuid: &str, _env: &Envelope) {
        self.peers
            .mutate(from_uuid, |p| {
                p.last_heartbeat_ms = Some(now_ms());
                p.last_seen_ms = now_ms();
            })
            .await;
    }

    async fn emit_sync_update(&self, uuid: &str) {
        if let Some(record) = self.peers.get(uuid).await {
            self.events.push(BridgeEvent::SyncPeerUpdated {
                ts: now_ms(),
                uuid: record.uuid,
                stream_id: record.stream_id,
                handshake_state: record.handshake_state,
                auth_ok: record.auth_ok,
            });
        }
    }
}
