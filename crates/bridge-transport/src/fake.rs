//! A deterministic in-process [`PeerTransport`] used by the end-to-end tests.
//! Several [`FakeTransport`]s share a [`FakeNetwork`] the way
//! several `haven-gateway::Dispatcher` clients share one process — except
//! here each "client" is its own session rather than a WebSocket connection.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::events::{DataPayload, TransportEvent};
use crate::{PeerTransport, TransportError, TransportResult};

/// Shared room registry. Construct one per test and hand an `Arc` to every
/// [`FakeTransport::new`] that should be able to see the others.
pub struct FakeNetwork {
    rooms: Mutex<HashMap<String, Vec<Arc<Peer>>>>,
}

struct Peer {
    uuid: String,
    stream_id: Mutex<Option<String>>,
    tx: broadcast::Sender<TransportEvent>,
    open_to: Mutex<HashSet<String>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
        })
    }
}

/// A single peer's handle into a [`FakeNetwork`]. Implements [`PeerTransport`].
pub struct FakeTransport {
    network: Arc<FakeNetwork>,
    peer: Arc<Peer>,
    room: Mutex<Option<String>>,
    connected: Mutex<bool>,
    /// Optional fault-injection hook: given a mutable clone of the outbound
    /// payload, return `true` to drop it in flight (after any in-place
    /// mutation, which models corruption rather than loss).
    fault: Mutex<Option<Box<dyn FnMut(&mut Value) -> bool + Send>>>,
}

impl FakeTransport {
    pub fn new(network: Arc<FakeNetwork>) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        let peer = Arc::new(Peer {
            uuid: uuid::Uuid::new_v4().to_string(),
            stream_id: Mutex::new(None),
            tx,
            open_to: Mutex::new(HashSet::new()),
        });
        Self {
            network,
            peer,
            room: Mutex::new(None),
            connected: Mutex::new(false),
            fault: Mutex::new(None),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.peer.uuid
    }

    /// Install a fault-injection closure applied to every outbound payload.
    /// Returning `true` drops the (possibly mutated) message.
    pub fn set_fault(&self, f: impl FnMut(&mut Value) -> bool + Send + 'static) {
        *self.fault.lock().unwrap() = Some(Box::new(f));
    }

    pub fn clear_fault(&self) {
        *self.fault.lock().unwrap() = None;
    }

    fn room_peers(&self) -> Vec<Arc<Peer>> {
        let room = self.room.lock().unwrap().clone();
        match room {
            Some(r) => self
                .network
                .rooms
                .lock()
                .unwrap()
                .get(&r)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn connect(&self) -> TransportResult<()> {
        *self.connected.lock().unwrap() = true;
        let _ = self.peer.tx.send(TransportEvent::Connected);
        Ok(())
    }

    async fn join_room(&self, room: &str, _password: Option<&str>) -> TransportResult<()> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::NotConnected);
        }
        *self.room.lock().unwrap() = Some(room.to_string());
        self.network
            .rooms
            .lock()
            .unwrap()
            .entry(room.to_string())
            .or_default()
            .push(self.peer.clone());
        Ok(())
    }

    async fn announce(&self, stream_id: &str, _label: Option<&str>) -> TransportResult<()> {
        *self.peer.stream_id.lock().unwrap() = Some(stream_id.to_string());

        for other in self.room_peers() {
            if other.uuid == self.peer.uuid {
                continue;
            }
            let other_stream_id = other.stream_id.lock().unwrap().clone();
            if other_stream_id.is_none() {
                continue; // the other side hasn't announced yet; they'll discover us when they do
            }

            // Mutual discovery + immediate (fake) data-channel open.
            let _ = self.peer.tx.send(TransportEvent::PeerConnected {
                uuid: other.uuid.clone(),
                stream_id: other_stream_id.clone(),
            });
            let _ = other.tx.send(TransportEvent::PeerConnected {
                uuid: self.peer.uuid.clone(),
                stream_id: Some(stream_id.to_string()),
            });

            self.peer.open_to.lock().unwrap().insert(other.uuid.clone());
            other.open_to.lock().unwrap().insert(self.peer.uuid.clone());

            let _ = self.peer.tx.send(TransportEvent::DataChannelOpen {
                uuid: other.uuid.clone(),
                stream_id: other_stream_id,
            });
            let _ = other.tx.send(TransportEvent::DataChannelOpen {
                uuid: self.peer.uuid.clone(),
                stream_id: Some(stream_id.to_string()),
            });
        }
        Ok(())
    }

    async fn view(&self, _target_stream_id: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        *self.connected.lock().unwrap() = false;
        if let Some(room) = self.room.lock().unwrap().take() {
            let mut rooms = self.network.rooms.lock().unwrap();
            if let Some(peers) = rooms.get_mut(&room) {
                peers.retain(|p| p.uuid != self.peer.uuid);
                for other in peers.iter() {
                    let _ = other.tx.send(TransportEvent::PeerDisconnected {
                        uuid: self.peer.uuid.clone(),
                        stream_id: self.peer.stream_id.lock().unwrap().clone(),
                    });
                }
            }
        }
        let _ = self.peer.tx.send(TransportEvent::Disconnected);
        Ok(())
    }

    async fn send_data(&self, payload: &Value, target: Option<&str>) -> TransportResult<bool> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::NotConnected);
        }

        let mut outbound = payload.clone();
        if let Some(fault) = self.fault.lock().unwrap().as_mut() {
            if fault(&mut outbound) {
                debug!(target = target.unwrap_or("*"), "fake transport dropped message");
                return Ok(true);
            }
        }

        let peers = self.room_peers();
        let mut sent_any = false;
        for other in peers {
            if other.uuid == self.peer.uuid {
                continue;
            }
            if let Some(target_uuid) = target {
                if other.uuid != target_uuid {
                    continue;
                }
            }
            if !self.peer.open_to.lock().unwrap().contains(&other.uuid) {
                continue;
            }
            let _ = other.tx.send(TransportEvent::DataReceived {
                uuid: self.peer.uuid.clone(),
                stream_id: self.peer.stream_id.lock().unwrap().clone(),
                data: DataPayload::Json(outbound.clone()),
                fallback: false,
            });
            sent_any = true;
        }

        if target.is_some() && !sent_any {
            return Err(TransportError::UnknownPeer(target.unwrap().to_string()));
        }
        Ok(sent_any)
    }

    async fn send_ping(&self, _uuid: &str) -> TransportResult<()> {
        Ok(())
    }

    fn has_open_data_channel(&self, uuid: Option<&str>) -> bool {
        let open_to = self.peer.open_to.lock().unwrap();
        match uuid {
            Some(u) => open_to.contains(u),
            None => !open_to.is_empty(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.peer.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_peers_discover_each_other() {
        let net = FakeNetwork::new();
        let a = FakeTransport::new(net.clone());
        let b = FakeTransport::new(net.clone());

        a.connect().await.unwrap();
        b.connect().await.unwrap();
        a.join_room("room1", None).await.unwrap();
        b.join_room("room1", None).await.unwrap();

        let mut a_rx = a.subscribe();
        a.announce("agent_a", None).await.unwrap();
        b.announce("agent_b", None).await.unwrap();

        // `a` should see `b` connect once `b` announces.
        let mut saw_peer_connected = false;
        for _ in 0..4 {
            match a_rx.recv().await {
                Ok(TransportEvent::PeerConnected { uuid, .. }) if uuid == b.uuid() => {
                    saw_peer_connected = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        assert!(saw_peer_connected);
        assert!(a.has_open_data_channel(Some(b.uuid())));
    }

    #[tokio::test]
    async fn send_data_is_delivered_to_target() {
        let net = FakeNetwork::new();
        let a = FakeTransport::new(net.clone());
        let b = FakeTransport::new(net.clone());
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        a.join_room("room1", None).await.unwrap();
        b.join_room("room1", None).await.unwrap();
        a.announce("agent_a", None).await.unwrap();
        b.announce("agent_b", None).await.unwrap();

        let mut b_rx = b.subscribe();
        a.send_data(&serde_json::json!({"hello": "world"}), Some(b.uuid()))
            .await
            .unwrap();

        let evt = b_rx.recv().await.unwrap();
        match evt {
            TransportEvent::DataReceived { data: DataPayload::Json(v), .. } => {
                assert_eq!(v["hello"], "world");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
