//! End-to-end scenarios driven entirely over `FakeTransport`, exercising two
//! `ToolSurface`s (one per simulated peer) against a shared `FakeNetwork`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_core::tool_surface::TransportFactory;
use bridge_core::ToolSurface;
use bridge_transport::fake::{FakeNetwork, FakeTransport};
use bridge_transport::PeerTransport;
use bridge_types::{BridgeEvent, SessionConfig, TransferDirection};

struct TestTransportFactory {
    network: Arc<FakeNetwork>,
    built: Mutex<HashMap<String, Arc<FakeTransport>>>,
}

impl TestTransportFactory {
    fn new(network: Arc<FakeNetwork>) -> Self {
        Self { network, built: Mutex::new(HashMap::new()) }
    }

    fn transport_for(&self, stream_id: &str) -> Arc<FakeTransport> {
        self.built.lock().unwrap().get(stream_id).unwrap().clone()
    }
}

impl TransportFactory for TestTransportFactory {
    fn build(&self, config: &SessionConfig) -> Arc<dyn PeerTransport> {
        let transport = Arc::new(FakeTransport::new(self.network.clone()));
        self.built.lock().unwrap().insert(config.stream_id.clone(), transport.clone());
        transport
    }
}

fn base_config(stream_id: &str) -> SessionConfig {
    SessionConfig {
        signalling_endpoint: "fake://local".into(),
        room: "room1".into(),
        stream_id: stream_id.into(),
        target_stream_id: None,
        signalling_password: None,
        heartbeat_ms: 60_000,
        reconnect_ms: 200,
        max_reconnect_ms: 1_000,
        label: None,
        join_token: None,
        join_token_secret: None,
        join_token_ttl_secs: 3_600,
        enforce_join_token: false,
        allow_peer_stream_ids: Vec::new(),
        file_chunk_bytes: 16 * 1024,
        file_max_bytes: 256 * 1024 * 1024,
        file_ack_timeout_ms: 2_000,
        file_max_retries: 5,
        completed_transfer_cap: 256,
        require_session_mac: false,
        spool_dir: None,
        spool_threshold_bytes: 8 * 1024 * 1024,
        keep_spool_files: false,
        state_max_keys: 10_000,
        state_max_snapshot_entries: 2_000,
        event_queue_cap: 2_000,
    }
}

async fn wait_for_peer_uuid(ts: &ToolSurface, session_id: &str) -> String {
    for _ in 0..50 {
        let (events, _) = ts.receive(session_id, 16, 200).await.unwrap();
        for e in events {
            if let BridgeEvent::PeerConnected { uuid, .. } = e {
                return uuid;
            }
        }
    }
    panic!("timed out waiting for PeerConnected");
}

async fn wait_for<F: Fn(&BridgeEvent) -> bool>(ts: &ToolSurface, session_id: &str, pred: F) -> BridgeEvent {
    for _ in 0..100 {
        let (events, _) = ts.receive(session_id, 16, 200).await.unwrap();
        for e in events {
            if pred(&e) {
                return e;
            }
        }
    }
    panic!("timed out waiting for expected event");
}

#[tokio::test]
async fn message_echo_reaches_target_peer() {
    let network = FakeNetwork::new();
    let ts_a = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec!["echo".into()]);
    let ts_b = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec!["echo".into()]);

    let session_a = ts_a.connect(base_config("agent_a")).await.unwrap();
    let session_b = ts_b.connect(base_config("agent_b")).await.unwrap();

    let peer_b_uuid = wait_for_peer_uuid(&ts_a, &session_a).await;

    ts_a.send(&session_a, serde_json::json!({"msg": "hi"}), Some(&peer_b_uuid))
        .await
        .unwrap();

    let event = wait_for(&ts_b, &session_b, |e| matches!(e, BridgeEvent::DataReceived { .. })).await;
    match event {
        BridgeEvent::DataReceived { data, .. } => assert_eq!(data["msg"], "hi"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn small_file_transfers_end_to_end() {
    let network = FakeNetwork::new();
    let ts_a = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);
    let ts_b = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);

    let session_a = ts_a.connect(base_config("agent_a")).await.unwrap();
    let session_b = ts_b.connect(base_config("agent_b")).await.unwrap();
    let peer_b_uuid = wait_for_peer_uuid(&ts_a, &session_a).await;

    let payload = b"hello world".to_vec();
    let transfer_id = ts_a
        .file_send(&session_a, peer_b_uuid, payload.clone(), Some("greeting.txt".into()), Some("text/plain".into()))
        .await
        .unwrap();

    wait_for(&ts_b, &session_b, |e| matches!(e, BridgeEvent::FileReceived { transfer_id: t, .. } if t == &transfer_id)).await;

    let received = ts_b.file_receive(&session_b, &transfer_id).await.unwrap();
    assert_eq!(received, payload);

    let (outgoing, _) = ts_a.file_transfers(&session_a, TransferDirection::Outgoing).await.unwrap();
    let summary = outgoing.iter().find(|s| s.transfer_id == transfer_id).unwrap();
    assert_eq!(summary.status, bridge_types::TransferStatus::Completed);
}

#[tokio::test]
async fn large_transfer_spools_to_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let network = FakeNetwork::new();
    let ts_a = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);
    let ts_b = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);

    let mut config_a = base_config("agent_a");
    config_a.file_chunk_bytes = 64;
    let mut config_b = base_config("agent_b");
    config_b.file_chunk_bytes = 64;
    config_b.spool_dir = Some(tmp.path().to_string_lossy().to_string());
    config_b.spool_threshold_bytes = 100;

    let session_a = ts_a.connect(config_a).await.unwrap();
    let session_b = ts_b.connect(config_b).await.unwrap();
    let peer_b_uuid = wait_for_peer_uuid(&ts_a, &session_a).await;

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let transfer_id = ts_a
        .file_send(&session_a, peer_b_uuid, payload.clone(), None, None)
        .await
        .unwrap();

    wait_for(&ts_b, &session_b, |e| matches!(e, BridgeEvent::FileReceived { transfer_id: t, .. } if t == &transfer_id)).await;

    let (_, incoming) = ts_b.file_transfers(&session_b, TransferDirection::Incoming).await.unwrap();
    let summary = incoming.iter().find(|s| s.transfer_id == transfer_id).unwrap();
    assert!(summary.spooled);

    let received = ts_b.file_receive(&session_b, &transfer_id).await.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn corrupted_chunk_is_retried_and_eventually_succeeds() {
    let network = FakeNetwork::new();
    let factory_a = Arc::new(TestTransportFactory::new(network.clone()));
    let ts_a = ToolSurface::new(factory_a.clone(), vec![]);
    let ts_b = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);

    let mut config_a = base_config("agent_a");
    config_a.file_ack_timeout_ms = 300;
    let session_a = ts_a.connect(config_a).await.unwrap();
    let session_b = ts_b.connect(base_config("agent_b")).await.unwrap();
    let peer_b_uuid = wait_for_peer_uuid(&ts_a, &session_a).await;

    let transport_a = factory_a.transport_for("agent_a");
    let corrupted_once = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let corrupted_once = corrupted_once.clone();
        transport_a.set_fault(move |payload| {
            if payload.get("kind").and_then(|k| k.as_str()) == Some("file.chunk")
                && !corrupted_once.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                if let Some(data) = payload.get_mut("payload").and_then(|p| p.get_mut("data_base64")) {
                    *data = serde_json::Value::String("not-the-real-bytes".into());
                }
            }
            false
        });
    }

    let payload = b"retry me please".to_vec();
    let transfer_id = ts_a
        .file_send(&session_a, peer_b_uuid, payload.clone(), None, None)
        .await
        .unwrap();

    wait_for(&ts_b, &session_b, |e| matches!(e, BridgeEvent::FileReceived { transfer_id: t, .. } if t == &transfer_id)).await;

    let received = ts_b.file_receive(&session_b, &transfer_id).await.unwrap();
    assert_eq!(received, payload);

    let (outgoing, _) = ts_a.file_transfers(&session_a, TransferDirection::Outgoing).await.unwrap();
    let summary = outgoing.iter().find(|s| s.transfer_id == transfer_id).unwrap();
    assert!(summary.retries_total >= 1);
}

#[tokio::test]
async fn dropped_ack_is_recovered_by_retry() {
    let network = FakeNetwork::new();
    let ts_a = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);
    let factory_b = Arc::new(TestTransportFactory::new(network.clone()));
    let ts_b = ToolSurface::new(factory_b.clone(), vec![]);

    let mut config_a = base_config("agent_a");
    config_a.file_ack_timeout_ms = 300;
    let session_a = ts_a.connect(config_a).await.unwrap();
    let session_b = ts_b.connect(base_config("agent_b")).await.unwrap();
    let peer_b_uuid = wait_for_peer_uuid(&ts_a, &session_a).await;

    let transport_b = factory_b.transport_for("agent_b");
    let dropped_once = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let dropped_once = dropped_once.clone();
        transport_b.set_fault(move |payload| {
            if payload.get("kind").and_then(|k| k.as_str()) == Some("file.ack")
                && !dropped_once.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                return true; // drop the first ack
            }
            false
        });
    }

    let payload = b"ack please arrive eventually".to_vec();
    let transfer_id = ts_a
        .file_send(&session_a, peer_b_uuid, payload.clone(), None, None)
        .await
        .unwrap();

    wait_for(&ts_b, &session_b, |e| matches!(e, BridgeEvent::FileReceived { transfer_id: t, .. } if t == &transfer_id)).await;

    let received = ts_b.file_receive(&session_b, &transfer_id).await.unwrap();
    assert_eq!(received, payload);

    let (outgoing, _) = ts_a.file_transfers(&session_a, TransferDirection::Outgoing).await.unwrap();
    let summary = outgoing.iter().find(|s| s.transfer_id == transfer_id).unwrap();
    assert!(summary.retries_total >= 1);
}

#[tokio::test]
async fn state_updates_converge_by_clock_then_actor() {
    let network = FakeNetwork::new();
    let ts_a = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);
    let ts_b = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);

    let session_a = ts_a.connect(base_config("agent_a")).await.unwrap();
    let session_b = ts_b.connect(base_config("agent_b")).await.unwrap();
    wait_for_peer_uuid(&ts_a, &session_a).await;
    wait_for_peer_uuid(&ts_b, &session_b).await;

    ts_a.state_set(&session_a, "shared".into(), serde_json::json!(1)).await.unwrap();
    wait_for(&ts_b, &session_b, |e| matches!(e, BridgeEvent::StateUpdated { key, .. } if key == "shared")).await;

    ts_b.state_set(&session_b, "shared".into(), serde_json::json!(2)).await.unwrap();
    wait_for(&ts_a, &session_a, |e| matches!(e, BridgeEvent::StateUpdated { key, .. } if key == "shared")).await;

    assert_eq!(ts_a.state_get(&session_a, "shared").await.unwrap(), Some(serde_json::json!(2)));
    assert_eq!(ts_b.state_get(&session_b, "shared").await.unwrap(), Some(serde_json::json!(2)));
}

#[tokio::test]
async fn join_token_and_stream_allowlist_gate_admission() {
    let network = FakeNetwork::new();
    let ts_a = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);
    let ts_b = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);

    let secret = "room-secret";
    let token = bridge_crypto::mint_join_token(
        secret,
        &bridge_crypto::TokenPayload {
            room: "room1".into(),
            stream_id: "agent_a".into(),
            exp: chrono::Utc::now().timestamp() + 3_600,
            nonce: "n1".into(),
        },
    );

    let mut config_a = base_config("agent_a");
    config_a.join_token = Some(token);

    let mut config_b = base_config("agent_b");
    config_b.enforce_join_token = true;
    config_b.join_token_secret = Some(secret.into());
    config_b.allow_peer_stream_ids = vec!["agent_a".into()];

    let session_a = ts_a.connect(config_a).await.unwrap();
    let session_b = ts_b.connect(config_b).await.unwrap();
    let peer_a_uuid = wait_for_peer_uuid(&ts_b, &session_b).await;

    wait_for(&ts_b, &session_b, |e| matches!(e, BridgeEvent::SyncPeerUpdated { auth_ok: true, .. })).await;

    let peers_b = ts_b.sync_peers(&session_b).await.unwrap();
    let record = peers_b.iter().find(|p| p.uuid == peer_a_uuid).unwrap();
    assert!(record.auth_ok);
}

#[tokio::test]
async fn peer_without_valid_token_is_rejected() {
    let network = FakeNetwork::new();
    let ts_a = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);
    let ts_b = ToolSurface::new(Arc::new(TestTransportFactory::new(network.clone())), vec![]);

    let mut config_b = base_config("agent_b");
    config_b.enforce_join_token = true;
    config_b.join_token_secret = Some("room-secret".into());

    let session_a = ts_a.connect(base_config("agent_a")).await.unwrap();
    let session_b = ts_b.connect(config_b).await.unwrap();
    wait_for_peer_uuid(&ts_a, &session_a).await;

    wait_for(&ts_b, &session_b, |e| matches!(e, BridgeEvent::SyncPeerRejected { .. })).await;
}
