//! In-memory table of peers seen in the current room. Holds the derived
//! shared key alongside the public summary fields; `PeerRecord::from` never
//! copies the key out.

use std::collections::HashMap;

use bridge_types::{HandshakeState, PeerRecord};
use tokio::sync::RwLock;

pub struct PeerEntry {
    pub uuid: String,
    pub stream_id: Option<String>,
    pub connected: bool,
    pub last_seen_ms: i64,
    pub last_heartbeat_ms: Option<i64>,
    pub handshake_state: HandshakeState,
    pub auth_ok: bool,
    pub rejected_reason: Option<String>,
    pub shared_key: Option<[u8; 32]>,
    pub capabilities: Vec<String>,
    pub remote_public_key_b64: Option<String>,
}

impl PeerEntry {
    pub fn new(uuid: String, now_ms: i64) -> Self {
        Self {
            uuid,
            stream_id: None,
            connected: true,
            last_seen_ms: now_ms,
            last_heartbeat_ms: None,
            handshake_state: HandshakeState::Discovered,
            auth_ok: false,
            rejected_reason: None,
            shared_key: None,
            capabilities: Vec::new(),
            remote_public_key_b64: None,
        }
    }

    pub fn to_record(&self) -> PeerRecord {
        PeerRecord {
            uuid: self.uuid.clone(),
            stream_id: self.stream_id.clone(),
            connected: self.connected,
            last_seen_ms: self.last_seen_ms,
            last_heartbeat_ms: self.last_heartbeat_ms,
            handshake_state: self.handshake_state,
            auth_ok: self.auth_ok,
            rejected_reason: self.rejected_reason.clone(),
            shared_key_ready: self.shared_key.is_some(),
            capabilities: self.capabilities.clone(),
        }
    }
}

#[derive(Default)]
pub struct PeerTable {
    inner: RwLock<HashMap<String, PeerEntry>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_insert(&self, uuid: &str, now_ms: i64) -> bool {
        let mut guard = self.inner.write().await;
        if guard.contains_key(uuid) {
            false
        } else {
            guard.insert(uuid.to_string(), PeerEntry::new(uuid.to_string(), now_ms));
            true
        }
    }

    pub async fn mutate<R>(&self, uuid: &str, f: impl FnOnce(&mut PeerEntry) -> R) -> Option<R> {
        let mut guard = self.inner.write().await;
        guard.get_mut(uuid).map(f)
    }

    pub async fn get(&self, uuid: &str) -> Option<PeerRecord> {
        self.inner.read().await.get(uuid).map(PeerEntry::to_record)
    }

    pub async fn shared_key(&self, uuid: &str) -> Option<[u8; 32]> {
        self.inner.read().await.get(uuid).and_then(|p| p.shared_key)
    }

    pub async fn is_auth_ok(&self, uuid: &str) -> bool {
        self.inner
            .read()
            .await
            .get(uuid)
            .map(|p| p.auth_ok)
            .unwrap_or(false)
    }

    pub async fn list(&self) -> Vec<PeerRecord> {
        self.inner.read().await.values().map(PeerEntry::to_record).collect()
    }

    pub async fn remove(&self, uuid: &str) -> Option<PeerRecord> {
        self.inner.write().await.remove(uuid).map(|p| p.to_record())
    }

    pub async fn mark_disconnected(&self, uuid: &str) {
        let mut guard = self.inner.write().await;
        if let Some(p) = guard.get_mut(uuid) {
            p.connected = false;
        }
    }

    pub async fn any_connected(&self) -> bool {
        self.inner.read().await.values().any(|p| p.connected)
    }
}
