//! Process entry point: loads configuration, builds the tool surface, and
//! runs whichever MCP transport (`stdio` or `http`) the environment selects.
//!
//! The transport a `connect` tool call rides on is a [`bridge_transport::PeerTransport`]
//! built here via [`LocalNetworkFactory`]. It wires every session in this
//! process into one shared [`bridge_transport::fake::FakeNetwork`] rendezvous,
//! which is enough for same-process peers (tests, demos, two tool callers
//! sharing one server) to reach each other. A deployment that bridges across
//! real machines swaps this factory for one that builds an adapter over an
//! actual WebRTC SDK; `BridgeSession` only ever depends on the `PeerTransport`
//! trait, so that swap touches no code outside this file.

use std::net::SocketAddr;
use std::sync::Arc;

use bridge_core::{ToolSurface, TransportFactory};
use bridge_mcp::http::HttpConfig;
use bridge_mcp::{Dispatcher, ToolProfile};
use bridge_transport::fake::{FakeNetwork, FakeTransport};
use bridge_transport::PeerTransport;
use bridge_types::SessionConfig;
use tracing::info;

struct LocalNetworkFactory {
    network: Arc<FakeNetwork>,
}

impl TransportFactory for LocalNetworkFactory {
    fn build(&self, _config: &SessionConfig) -> Arc<dyn PeerTransport> {
        Arc::new(FakeTransport::new(self.network.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vdo_mcp_bridge=info,bridge_core=info".into()),
        )
        .init();

    let mode = std::env::var("VDO_BRIDGE_MODE").unwrap_or_else(|_| "stdio".into());
    let tool_profile = std::env::var("VDO_BRIDGE_TOOL_PROFILE")
        .map(|csv| ToolProfile::from_csv(&csv))
        .unwrap_or_else(|_| ToolProfile::unrestricted());

    let local_capabilities = vec!["sync".to_string(), "files".to_string(), "state".to_string()];
    let factory = Arc::new(LocalNetworkFactory { network: FakeNetwork::new() });
    let tool_surface = Arc::new(ToolSurface::new(factory, local_capabilities));
    let dispatcher = Arc::new(Dispatcher::new(tool_surface, tool_profile));

    info!(mode = %mode, "starting vdo-mcp-bridge");

    match mode.as_str() {
        "http" => {
            let bind_addr: SocketAddr = std::env::var("VDO_BRIDGE_HTTP_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8787".into())
                .parse()?;
            let max_body_bytes: usize = std::env::var("VDO_BRIDGE_HTTP_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8 * 1024 * 1024);
            let bearer_token = std::env::var("VDO_BRIDGE_HTTP_BEARER_TOKEN").ok().filter(|s| !s.is_empty());

            bridge_mcp::http::run(dispatcher, HttpConfig { bind_addr, bearer_token, max_body_bytes }).await
        }
        "stdio" => bridge_mcp::stdio::run(dispatcher).await,
        other => anyhow::bail!("unknown VDO_BRIDGE_MODE `{other}`, expected `stdio` or `http`"),
    }
}
