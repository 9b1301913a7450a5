//! The named operations an MCP tool call ultimately resolves to. Kept
//! transport-agnostic: callers supply a [`TransportFactory`] so tests can
//! wire in `bridge_transport::fake::FakeTransport` instead of a real
//! WebRTC adapter.

use std::sync::Arc;

use bridge_transport::PeerTransport;
use bridge_types::{
    BridgeEvent, IncomingTransferSummary, OutgoingTransferSummary, PeerRecord, SessionConfig,
    TransferDirection,
};
use crate::file_transfer::FileSendOptions;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::SessionRegistry;
use crate::session::{BridgeSession, SessionSnapshot};

pub trait TransportFactory: Send + Sync {
    fn build(&self, config: &SessionConfig) -> Arc<dyn PeerTransport>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_magic: String,
    pub crate_version: String,
    pub features: Vec<String>,
}

pub struct ToolSurface {
    registry: Arc<SessionRegistry>,
    transport_factory: Arc<dyn TransportFactory>,
    local_capabilities: Vec<String>,
}

impl ToolSurface {
    pub fn new(transport_factory: Arc<dyn TransportFactory>, local_capabilities: Vec<String>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            transport_factory,
            local_capabilities,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            protocol_magic: bridge_types::ENVELOPE_MAGIC.to_string(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            features: self.local_capabilities.clone(),
        }
    }

    pub async fn connect(&self, config: SessionConfig) -> BridgeResult<String> {
        if config.room.is_empty() {
            return Err(BridgeError::InvalidArgument("room must not be empty".into()));
        }
        if config.stream_id.is_empty() {
            return Err(BridgeError::InvalidArgument("stream_id must not be empty".into()));
        }

        let session_id = Uuid::new_v4().simple().to_string();
        let transport = self.transport_factory.build(&config);
        let session = BridgeSession::new(session_id.clone(), config, transport, self.local_capabilities.clone());
        self.registry.insert(session.clone()).await;
        session.start().await?;
        Ok(session_id)
    }

    async fn session(&self, session_id: &str) -> BridgeResult<Arc<BridgeSession>> {
        self.registry
            .get(session_id)
            .await
            .ok_or_else(|| BridgeError::UnknownSession(session_id.to_string()))
    }

    pub async fn send(
        &self,
        session_id: &str,
        payload: serde_json::Value,
        target: Option<serde_json::Value>,
    ) -> BridgeResult<crate::session::SendOutcome> {
        self.session(session_id).await?.send(payload, target).await
    }

    pub async fn receive(&self, session_id: &str, max_events: usize, wait_ms: u64) -> BridgeResult<(Vec<BridgeEvent>, u64)> {
        let session = self.session(session_id).await?;
        let drained = session.event_queue().poll(max_events, wait_ms).await;
        Ok((drained.events, drained.dropped_since_last_poll))
    }

    pub async fn status(&self, session_id: &str) -> BridgeResult<SessionSnapshot> {
        Ok(self.session(session_id).await?.snapshot().await)
    }

    pub async fn disconnect(&self, session_id: &str) -> BridgeResult<()> {
        let session = self.session(session_id).await?;
        session.stop().await?;
        self.registry.remove(session_id).await;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut out = Vec::new();
        for session in self.registry.list().await {
            out.push(session.snapshot().await);
        }
        out
    }

    pub async fn sync_peers(&self, session_id: &str) -> BridgeResult<Vec<PeerRecord>> {
        Ok(self.session(session_id).await?.peers().await)
    }

    pub async fn sync_announce(&self, session_id: &str) -> BridgeResult<()> {
        let session = self.session(session_id).await?;
        for peer in session.peers().await {
            session.handshake.greet(&peer.uuid).await;
        }
        Ok(())
    }

    pub async fn file_send(
        &self,
        session_id: &str,
        target_uuid: String,
        data: Vec<u8>,
        name: Option<String>,
        mime: Option<String>,
        opts: FileSendOptions,
    ) -> BridgeResult<OutgoingTransferSummary> {
        let session = self.session(session_id).await?;
        session.files.clone().send_file_and_await(target_uuid, data, name, mime, opts).await
    }

    pub async fn file_resume(
        &self,
        session_id: &str,
        transfer_id: &str,
        start_seq: Option<u32>,
    ) -> BridgeResult<OutgoingTransferSummary> {
        let session = self.session(session_id).await?;
        session.files.clone().resume_outgoing(transfer_id, start_seq).await
    }

    pub async fn file_transfers(
        &self,
        session_id: &str,
        direction: TransferDirection,
    ) -> BridgeResult<(Vec<OutgoingTransferSummary>, Vec<IncomingTransferSummary>)> {
        Ok(self.session(session_id).await?.transfers(direction).await)
    }

    pub async fn file_receive(&self, session_id: &str, transfer_id: &str) -> BridgeResult<Vec<u8>> {
        let session = self.session(session_id).await?;
        session.files.read_incoming_bytes(transfer_id).await
    }

    pub async fn file_save(&self, session_id: &str, transfer_id: &str, dest: &std::path::Path) -> BridgeResult<u64> {
        let session = self.session(session_id).await?;
        session.files.save_incoming_to_path(transfer_id, dest).await
    }

    pub async fn state_set(&self, session_id: &str, key: String, value: serde_json::Value) -> BridgeResult<u64> {
        let session = self.session(session_id).await?;
        session.state.set(key, value).await
    }

    pub async fn state_get(&self, session_id: &str, key: &str) -> BridgeResult<Option<serde_json::Value>> {
        let session = self.session(session_id).await?;
        Ok(session.state.get(key).await)
    }

    pub async fn state_sync(&self, session_id: &str) -> BridgeResult<()> {
        let session = self.session(session_id).await?;
        session.state.request_snapshot().await;
        Ok(())
    }
}
