//! JSON-RPC 2.0 envelope and the `Dispatcher` that resolves MCP methods
//! against a [`bridge_core::ToolSurface`]. Framing (stdio or HTTP) lives in
//! the sibling modules; this module only knows about request/response values.

use std::sync::Arc;

use bridge_core::ToolSurface;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::profile::ToolProfile;
use crate::tools::{all_tool_defs, call_tool};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Tool ran but failed for operational reasons (unreachable peer, timed-out
/// transfer, and so on) rather than because the call itself was malformed.
pub const TOOL_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code, message: message.into(), data: None }) }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("RpcResponse always serializes")
    }
}

pub struct Dispatcher {
    tool_surface: Arc<ToolSurface>,
    profile: ToolProfile,
    server_name: &'static str,
}

impl Dispatcher {
    pub fn new(tool_surface: Arc<ToolSurface>, profile: ToolProfile) -> Self {
        Self { tool_surface, profile, server_name: "vdo-mcp-bridge" }
    }

    pub fn tool_surface(&self) -> &Arc<ToolSurface> {
        &self.tool_surface
    }

    /// A notification (no `id`) never produces a response; callers should
    /// still invoke this for side effects but discard a `None` result.
    pub fn is_notification(req: &RpcRequest) -> bool {
        req.id.is_none()
    }

    pub async fn dispatch(&self, req: RpcRequest) -> Option<RpcResponse> {
        let id = req.id.clone().unwrap_or(Value::Null);
        let is_notification = Self::is_notification(&req);

        let response = match req.method.as_str() {
            "initialize" => RpcResponse::ok(
                id.clone(),
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": { "name": self.server_name, "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": { "tools": { "listChanged": false } },
                }),
            ),
            "ping" => RpcResponse::ok(id.clone(), json!({})),
            "notifications/initialized" => return None,
            "shutdown" => RpcResponse::ok(id.clone(), json!({})),
            "resources/list" => RpcResponse::ok(id.clone(), json!({ "resources": [] })),
            "prompts/list" => RpcResponse::ok(id.clone(), json!({ "prompts": [] })),
            "tools/list" => {
                let tools: Vec<Value> = all_tool_defs()
                    .into_iter()
                    .filter(|t| self.profile.is_allowed(t.name))
                    .map(|t| json!({ "name": t.name, "description": t.description, "inputSchema": t.input_schema }))
                    .collect();
                RpcResponse::ok(id.clone(), json!({ "tools": tools }))
            }
            "tools/call" => self.dispatch_tool_call(id.clone(), &req.params).await,
            other => RpcResponse::err(id.clone(), METHOD_NOT_FOUND, format!("unknown method `{other}`")),
        };

        if is_notification {
            None
        } else {
            Some(response)
        }
    }

    async fn dispatch_tool_call(&self, id: Value, params: &Value) -> RpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return RpcResponse::err(id, INVALID_PARAMS, "`tools/call` requires a string `name`");
        };
        if !self.profile.is_allowed(name) {
            let message = format!("tool `{name}` is not enabled on profile `{}`", self.profile.name());
            warn!(tool = name, profile = self.profile.name(), "tool call rejected by profile");
            return RpcResponse::ok(id, tool_failure_result(name, "validation_error", &message));
        }
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match call_tool(&self.tool_surface, name, args).await {
            Ok(value) => {
                info!(tool = name, "tool call succeeded");
                RpcResponse::ok(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": value.to_string() }],
                        "structuredContent": value,
                        "isError": false,
                    }),
                )
            }
            Err(e) if e.is_validation() => {
                warn!(tool = name, error = %e, "tool call rejected: bad arguments");
                RpcResponse::ok(id, tool_failure_result(name, "validation_error", &e.to_string()))
            }
            Err(e) => {
                warn!(tool = name, error = %e, "tool call failed");
                RpcResponse::ok(id, tool_failure_result(name, "tool_error", &e.to_string()))
            }
        }
    }
}

fn tool_failure_result(tool: &str, error_type: &str, message: &str) -> Value {
    let payload = json!({ "ok": false, "error": { "type": error_type, "message": message, "tool": tool } });
    json!({
        "content": [{ "type": "text", "text": payload.to_string() }],
        "structuredContent": payload,
        "isError": true,
        "payload": payload,
    })
}

pub fn parse_error_response(detail: impl Into<String>) -> RpcResponse {
    RpcResponse::err(Value::Null, PARSE_ERROR, detail.into())
}

pub fn invalid_request_response(detail: impl Into<String>) -> RpcResponse {
    RpcResponse::err(Value::Null, INVALID_REQUEST, detail.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{Capabilities, TransportFactory};
    use bridge_transport::PeerTransport;
    use bridge_types::SessionConfig;

    struct NoopFactory;
    impl TransportFactory for NoopFactory {
        fn build(&self, _config: &SessionConfig) -> Arc<dyn PeerTransport> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn dispatcher() -> Dispatcher {
        let surface = Arc::new(ToolSurface::new(Arc::new(NoopFactory), vec!["files".into(), "state".into()]));
        Dispatcher::new(surface, ToolProfile::unrestricted())
    }

    fn req(method: &str, params: Value) -> RpcRequest {
        RpcRequest { jsonrpc: Some("2.0".into()), id: Some(json!(1)), method: method.into(), params }
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let d = dispatcher();
        let resp = d.dispatch(req("bogus", json!({}))).await.unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_list_respects_profile() {
        let surface = Arc::new(ToolSurface::new(Arc::new(NoopFactory), vec![]));
        let d = Dispatcher::new(surface, ToolProfile::from_csv("state_set,state_get"));
        let resp = d.dispatch(req("tools/list", json!({}))).await.unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 2);
    }

    #[tokio::test]
    async fn tool_call_on_missing_session_is_invalid_params() {
        let d = dispatcher();
        let resp = d
            .dispatch(req("tools/call", json!({ "name": "status", "arguments": { "session_id": "nope" } })))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["payload"]["error"]["type"], json!("validation_error"));
        assert_eq!(result["payload"]["error"]["tool"], json!("status"));
    }

    #[tokio::test]
    async fn unrecognized_tool_name_is_rejected_by_profile() {
        let surface = Arc::new(ToolSurface::new(Arc::new(NoopFactory), vec![]));
        let d = Dispatcher::new(surface, ToolProfile::allow_only(["connect".to_string()]));
        let resp = d
            .dispatch(req("tools/call", json!({ "name": "file_send", "arguments": {} })))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["payload"]["error"]["type"], json!("validation_error"));
    }

    #[tokio::test]
    async fn notification_produces_no_response() {
        let d = dispatcher();
        let n = RpcRequest { jsonrpc: Some("2.0".into()), id: None, method: "notifications/initialized".into(), params: json!({}) };
        assert!(d.dispatch(n).await.is_none());
    }
}
