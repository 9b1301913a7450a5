//! Last-writer-wins shared key/value store replicated over `state.patch`
//! envelopes. Dominance between two writes to the same key is decided by
//! `(clock, actor)` — higher clock wins; a tie is broken by comparing actor
//! ids, which only matters when two actors apply the same clock value
//! simultaneously (should not happen with well-behaved clocks, but keeps the
//! merge total rather than partial).

use std::collections::BTreeMap;
use std::sync::Arc;

use bridge_transport::PeerTransport;
use bridge_types::{
    BridgeEvent, Envelope, EnvelopeKind, SessionConfig, StateEntryWire, StatePatchPayload,
    StateSnapshotPayload, StateSnapshotReqPayload,
};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{BridgeError, BridgeResult};
use crate::event_queue::EventQueue;
use crate::time::{new_nonce, now_ms};

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    actor: String,
    clock: u64,
}

pub struct StateEngine {
    config: Arc<SessionConfig>,
    transport: Arc<dyn PeerTransport>,
    events: Arc<EventQueue>,
    actor_id: String,
    store: RwLock<BTreeMap<String, Entry>>,
    local_clock: std::sync::atomic::AtomicU64,
}

impl StateEngine {
    pub fn new(config: Arc<SessionConfig>, transport: Arc<dyn PeerTransport>, events: Arc<EventQueue>, actor_id: String) -> Self {
        Self {
            config,
            transport,
            events,
            actor_id,
            store: RwLock::new(BTreeMap::new()),
            local_clock: std::sync::atomic::AtomicU64::new(0),
        }
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

    /// True when `(clock, actor)` of the incoming write dominates the stored
    /// entry (or there is no stored entry).
    fn dominates(existing: Option<&Entry>, clock: u64, actor: &str) -> bool {
        match existing {
            None => true,
            Some(e) => (clock, actor) > (e.clock, e.actor.as_str()),
        }
    }

    /// Apply a local `state_set`, broadcast the patch, and return the new clock.
    pub async fn set(&self, key: String, value: serde_json::Value) -> BridgeResult<u64> {
        if key.is_empty() {
            return Err(BridgeError::InvalidArgument("state key must not be empty".into()));
        }
        let mut store = self.store.write().await;
        if !store.contains_key(&key) && store.len() >= self.config.state_max_keys {
            return Err(BridgeError::InvalidArgument(format!(
                "state store is at its cap of {} keys",
                self.config.state_max_keys
            )));
        }
        let clock = self.local_clock.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        store.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                actor: self.actor_id.clone(),
                clock,
            },
        );
        drop(store);

        let env = self.envelope(
            EnvelopeKind::StatePatch,
            serde_json::to_value(StatePatchPayload {
                key: key.clone(),
                value,
                actor: self.actor_id.clone(),
                clock,
            })
            .expect("StatePatchPayload always serializes"),
        );
        let value = serde_json::to_value(&env).expect("Envelope always serializes");
        let _ = self.transport.send_data(&value, None).await;

        self.events.push(BridgeEvent::StateUpdated {
            ts: now_ms(),
            key,
            source: self.actor_id.clone(),
        });
        Ok(clock)
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.store.read().await.get(key).map(|e| e.value.clone())
    }

    pub async fn snapshot_entries(&self) -> Vec<StateEntryWire> {
        self.store
            .read()
            .await
            .iter()
            .take(self.config.state_max_snapshot_entries)
            .map(|(k, e)| StateEntryWire {
                key: k.clone(),
                value: e.value.clone(),
                actor: e.actor.clone(),
                clock: e.clock,
            })
            .collect()
    }

    pub async fn handle_patch(&self, env: &Envelope) {
        let payload: StatePatchPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed state.patch");
                return;
            }
        };
        let mut store = self.store.write().await;
        let existing = store.get(&payload.key);
        if !Self::dominates(existing, payload.clock, &payload.actor) {
            return; // a newer or equal-priority write already won
        }
        if !store.contains_key(&payload.key) && store.len() >= self.config.state_max_keys {
            warn!(key = %payload.key, "dropping remote state.patch, store at key cap");
            return;
        }
        store.insert(
            payload.key.clone(),
            Entry {
                value: payload.value,
                actor: payload.actor.clone(),
                clock: payload.clock,
            },
        );
        drop(store);

        if payload.clock > self.local_clock.load(std::sync::atomic::Ordering::SeqCst) {
            self.local_clock.store(payload.clock, std::sync::atomic::Ordering::SeqCst);
        }

        self.events.push(BridgeEvent::StateUpdated {
            ts: now_ms(),
            key: payload.key,
            source: payload.actor,
        });
    }

    pub async fn request_snapshot(&self) {
        let env = self.envelope(
            EnvelopeKind::StateSnapshotReq,
            serde_json::to_value(StateSnapshotReqPayload {}).expect("always serializes"),
        );
        let value = serde_json::to_value(&env).expect("Envelope always serializes");
        let _ = self.transport.send_data(&value, None).await;
    }

    /// Same as [`Self::request_snapshot`] but aimed at a single peer, used to
    /// catch a just-admitted (or reconnected) peer up on state right after
    /// the handshake completes instead of waiting for a manual `state_sync`.
    pub async fn request_snapshot_from(&self, target_uuid: &str) {
        let env = self.envelope(
            EnvelopeKind::StateSnapshotReq,
            serde_json::to_value(StateSnapshotReqPayload {}).expect("always serializes"),
        );
        let value = serde_json::to_value(&env).expect("Envelope always serializes");
        let _ = self.transport.send_data(&value, Some(target_uuid)).await;
    }

    pub async fn handle_snapshot_request(&self, from_uuid: &str) {
        let entries = self.snapshot_entries().await;
        let env = self.envelope(
            EnvelopeKind::StateSnapshot,
            serde_json::to_value(StateSnapshotPayload {
                room: self.config.room.clone(),
                stream_id: self.config.stream_id.clone(),
                entries,
                actor_clock: [(self.actor_id.clone(), self.local_clock.load(std::sync::atomic::Ordering::SeqCst))]
                    .into_iter()
                    .collect(),
                generated_at: now_ms(),
            })
            .expect("StateSnapshotPayload always serializes"),
        );
        let value = serde_json::to_value(&env).expect("Envelope always serializes");
        let _ = self.transport.send_data(&value, Some(from_uuid)).await;
    }

    /// Merge every entry in a received snapshot using the same dominance rule
    /// as a single patch, so a snapshot can never un-apply a winning local write.
    pub async fn handle_snapshot(&self, env: &Envelope) {
        let payload: StateSnapshotPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed state.snapshot");
                return;
            }
        };
        let mut applied = 0usize;
        for entry in payload.entries {
            let mut store = self.store.write().await;
            let existing = store.get(&entry.key);
            if Self::dominates(existing, entry.clock, &entry.actor) {
                if store.contains_key(&entry.key) || store.len() < self.config.state_max_keys {
                    store.insert(
                        entry.key.clone(),
                        Entry {
                            value: entry.value,
                            actor: entry.actor,
                            clock: entry.clock,
                        },
                    );
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            self.events.push(BridgeEvent::StateUpdated {
                ts: now_ms(),
                key: format!("<snapshot:{applied} entries>"),
                source: "snapshot".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_transport::fake::{FakeNetwork, FakeTransport};

    fn config() -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            signalling_endpoint: "wss://example".into(),
            room: "room1".into(),
            stream_id: "agent_a".into(),
            target_stream_id: None,
            signalling_password: None,
            heartbeat_ms: 15_000,
            reconnect_ms: 1_000,
            max_reconnect_ms: 30_000,
            label: None,
            join_token: None,
            join_token_secret: None,
            join_token_ttl_secs: 3_600,
            enforce_join_token: false,
            allow_peer_stream_ids: Vec::new(),
            file_chunk_bytes: 16 * 1024,
            file_max_bytes: 256 * 1024 * 1024,
            file_ack_timeout_ms: 5_000,
            file_max_retries: 5,
            completed_transfer_cap: 256,
            require_session_mac: false,
            spool_dir: None,
            spool_threshold_bytes: 8 * 1024 * 1024,
            keep_spool_files: false,
            state_max_keys: 10_000,
            state_max_snapshot_entries: 2_000,
            event_queue_cap: 2_000,
        })
    }

    #[tokio::test]
    async fn higher_clock_wins() {
        let net = FakeNetwork::new();
        let transport = Arc::new(FakeTransport::new(net));
        let events = Arc::new(EventQueue::new(16));
        let engine = StateEngine::new(config(), transport, events, "actor_a".into());

        let env1 = Envelope::new(
            EnvelopeKind::StatePatch,
            0,
            "n1".into(),
            "room1",
            "agent_b",
            serde_json::to_value(StatePatchPayload {
                key: "k".into(),
                value: serde_json::json!(1),
                actor: "actor_b".into(),
                clock: 5,
            })
            .unwrap(),
        );
        engine.handle_patch(&env1).await;
        assert_eq!(engine.get("k").await, Some(serde_json::json!(1)));

        let env2 = Envelope::new(
            EnvelopeKind::StatePatch,
            0,
            "n2".into(),
            "room1",
            "agent_b",
            serde_json::to_value(StatePatchPayload {
                key: "k".into(),
                value: serde_json::json!(2),
                actor: "actor_b".into(),
                clock: 3,
            })
            .unwrap(),
        );
        engine.handle_patch(&env2).await;
        // lower clock must not overwrite
        assert_eq!(engine.get("k").await, Some(serde_json::json!(1)));
    }
}
