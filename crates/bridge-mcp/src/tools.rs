//! Tool definitions (`tools/list`) and the `tools/call` dispatch table.
//! Each tool's arguments are deserialized from the JSON-RPC params object;
//! a malformed argument set surfaces as a validation error, never a panic.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bridge_core::{BridgeError, BridgeResult, FileSendOptions, ToolSurface};
use bridge_types::{SessionConfig, TransferDirection};
use serde_json::{json, Value};

pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

pub fn all_tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef { name: "connect", description: "Open a bridge session in a room.", input_schema: json!({"type":"object","properties":{"config":{"type":"object"}},"required":["config"]}) },
        ToolDef { name: "send", description: "Send an opaque JSON payload to one peer or broadcast.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"payload":{},"target":{}},"required":["session_id","payload"]}) },
        ToolDef { name: "receive", description: "Poll the session's event queue.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"max_events":{"type":"integer"},"wait_ms":{"type":"integer"}},"required":["session_id"]}) },
        ToolDef { name: "status", description: "Get a session's lifecycle status and peer table.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"}},"required":["session_id"]}) },
        ToolDef { name: "disconnect", description: "Stop and remove a session.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"}},"required":["session_id"]}) },
        ToolDef { name: "list_sessions", description: "List every session this process manages.", input_schema: json!({"type":"object","properties":{}}) },
        ToolDef { name: "capabilities", description: "Describe this build's protocol version and feature set.", input_schema: json!({"type":"object","properties":{}}) },
        ToolDef { name: "sync_peers", description: "List the peer table for a session.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"}},"required":["session_id"]}) },
        ToolDef { name: "sync_announce", description: "Re-send sync.hello to every known peer.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"}},"required":["session_id"]}) },
        ToolDef { name: "file_send", description: "Send a file (base64 or from a local path) to a target peer; returns a transfer summary once the transfer finishes.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"target_uuid":{"type":"string"},"data_base64":{"type":"string"},"file_path":{"type":"string"},"name":{"type":"string"},"mime":{"type":"string"},"chunk_bytes":{"type":"integer"},"ack_timeout_ms":{"type":"integer"},"max_retries":{"type":"integer"},"transfer_id":{"type":"string"}},"required":["session_id","target_uuid"]}) },
        ToolDef { name: "file_resume", description: "Resume a stalled outgoing transfer after reconnect; returns the updated transfer summary.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"transfer_id":{"type":"string"},"start_seq":{"type":"integer"}},"required":["session_id","transfer_id"]}) },
        ToolDef { name: "file_transfers", description: "List outgoing/incoming transfers.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"direction":{"type":"string","enum":["incoming","outgoing","all"]}},"required":["session_id"]}) },
        ToolDef { name: "file_receive", description: "Read back a completed incoming transfer in the requested encoding.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"transfer_id":{"type":"string"},"encoding":{"type":"string","enum":["base64","utf8","json"]}},"required":["session_id","transfer_id"]}) },
        ToolDef { name: "file_save", description: "Write a completed incoming transfer to disk.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"transfer_id":{"type":"string"},"path":{"type":"string"}},"required":["session_id","transfer_id","path"]}) },
        ToolDef { name: "state_set", description: "Set a key in the shared key/value store.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"key":{"type":"string"},"value":{}},"required":["session_id","key","value"]}) },
        ToolDef { name: "state_get", description: "Read a key from the shared key/value store.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"},"key":{"type":"string"}},"required":["session_id","key"]}) },
        ToolDef { name: "state_sync", description: "Request a full state snapshot from peers.", input_schema: json!({"type":"object","properties":{"session_id":{"type":"string"}},"required":["session_id"]}) },
    ]
}

fn str_field(v: &Value, field: &str) -> Result<String, BridgeError> {
    v.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::InvalidArgument(format!("missing or non-string field `{field}`")))
}

fn direction_field(v: &Value) -> TransferDirection {
    match v.get("direction").and_then(Value::as_str) {
        Some("incoming") => TransferDirection::Incoming,
        Some("outgoing") => TransferDirection::Outgoing,
        _ => TransferDirection::All,
    }
}

pub async fn call_tool(tool_surface: &ToolSurface, name: &str, args: Value) -> BridgeResult<Value> {
    match name {
        "connect" => {
            let config: SessionConfig = serde_json::from_value(
                args.get("config")
                    .cloned()
                    .ok_or_else(|| BridgeError::InvalidArgument("missing `config`".into()))?,
            )
            .map_err(|e| BridgeError::InvalidArgument(format!("invalid session config: {e}")))?;
            let session_id = tool_surface.connect(config).await?;
            Ok(json!({ "session_id": session_id }))
        }
        "send" => {
            let session_id = str_field(&args, "session_id")?;
            let payload = args
                .get("payload")
                .cloned()
                .ok_or_else(|| BridgeError::InvalidArgument("missing `payload`".into()))?;
            let target = args.get("target").cloned();
            let outcome = tool_surface.send(&session_id, payload, target).await?;
            Ok(json!({ "ok": outcome.ok, "used_target": outcome.used_target }))
        }
        "receive" => {
            let session_id = str_field(&args, "session_id")?;
            let max_events = args.get("max_events").and_then(Value::as_u64).unwrap_or(20) as usize;
            let wait_ms = args.get("wait_ms").and_then(Value::as_u64).unwrap_or(0);
            let (events, dropped) = tool_surface.receive(&session_id, max_events, wait_ms).await?;
            Ok(json!({ "events": events, "dropped_since_last_poll": dropped }))
        }
        "status" => {
            let session_id = str_field(&args, "session_id")?;
            Ok(serde_json::to_value(tool_surface.status(&session_id).await?).expect("snapshot serializes"))
        }
        "disconnect" => {
            let session_id = str_field(&args, "session_id")?;
            tool_surface.disconnect(&session_id).await?;
            Ok(json!({}))
        }
        "list_sessions" => Ok(json!({ "sessions": tool_surface.list_sessions().await })),
        "capabilities" => Ok(serde_json::to_value(tool_surface.capabilities()).expect("capabilities serializes")),
        "sync_peers" => {
            let session_id = str_field(&args, "session_id")?;
            Ok(json!({ "peers": tool_surface.sync_peers(&session_id).await? }))
        }
        "sync_announce" => {
            let session_id = str_field(&args, "session_id")?;
            tool_surface.sync_announce(&session_id).await?;
            Ok(json!({}))
        }
        "file_send" => {
            let session_id = str_field(&args, "session_id")?;
            let target_uuid = str_field(&args, "target_uuid")?;
            let data_b64 = args.get("data_base64").and_then(Value::as_str);
            let file_path = args.get("file_path").and_then(Value::as_str);
            let data = match (data_b64, file_path) {
                (Some(_), Some(_)) => {
                    return Err(BridgeError::InvalidArgument(
                        "provide either `data_base64` or `file_path`, not both".into(),
                    ))
                }
                (Some(b64), None) => BASE64
                    .decode(b64)
                    .map_err(|_| BridgeError::InvalidArgument("data_base64 is not valid base64".into()))?,
                (None, Some(path)) => tokio::fs::read(path)
                    .await
                    .map_err(|e| BridgeError::InvalidArgument(format!("failed to read `file_path`: {e}")))?,
                (None, None) => {
                    return Err(BridgeError::InvalidArgument(
                        "must provide one of `data_base64` or `file_path`".into(),
                    ))
                }
            };
            let name = args.get("name").and_then(Value::as_str).map(str::to_string);
            let mime = args.get("mime").and_then(Value::as_str).map(str::to_string);
            let opts = FileSendOptions {
                chunk_bytes: args.get("chunk_bytes").and_then(Value::as_u64).map(|v| v as u32),
                ack_timeout_ms: args.get("ack_timeout_ms").and_then(Value::as_u64),
                max_retries: args.get("max_retries").and_then(Value::as_u64).map(|v| v as u32),
                transfer_id: args.get("transfer_id").and_then(Value::as_str).map(str::to_string),
            };
            let summary = tool_surface.file_send(&session_id, target_uuid, data, name, mime, opts).await?;
            Ok(serde_json::to_value(summary).expect("transfer summary serializes"))
        }
        "file_resume" => {
            let session_id = str_field(&args, "session_id")?;
            let transfer_id = str_field(&args, "transfer_id")?;
            let start_seq = args.get("start_seq").and_then(Value::as_u64).map(|v| v as u32);
            let summary = tool_surface.file_resume(&session_id, &transfer_id, start_seq).await?;
            Ok(serde_json::to_value(summary).expect("transfer summary serializes"))
        }
        "file_transfers" => {
            let session_id = str_field(&args, "session_id")?;
            let direction = direction_field(&args);
            let (outgoing, incoming) = tool_surface.file_transfers(&session_id, direction).await?;
            Ok(json!({ "outgoing": outgoing, "incoming": incoming }))
        }
        "file_receive" => {
            let session_id = str_field(&args, "session_id")?;
            let transfer_id = str_field(&args, "transfer_id")?;
            let encoding = args.get("encoding").and_then(Value::as_str).unwrap_or("base64");
            let bytes = tool_surface.file_receive(&session_id, &transfer_id).await?;
            match encoding {
                "base64" => Ok(json!({ "data_base64": BASE64.encode(bytes) })),
                "utf8" => {
                    let text = String::from_utf8(bytes)
                        .map_err(|_| BridgeError::InvalidArgument("transfer bytes are not valid utf8".into()))?;
                    Ok(json!({ "data_text": text }))
                }
                "json" => {
                    let value: Value = serde_json::from_slice(&bytes)
                        .map_err(|e| BridgeError::InvalidArgument(format!("transfer bytes are not valid json: {e}")))?;
                    Ok(json!({ "data_json": value }))
                }
                other => Err(BridgeError::InvalidArgument(format!("unknown encoding `{other}`"))),
            }
        }
        "file_save" => {
            let session_id = str_field(&args, "session_id")?;
            let transfer_id = str_field(&args, "transfer_id")?;
            let path_str = str_field(&args, "path")?;
            let bytes_written = tool_surface.file_save(&session_id, &transfer_id, std::path::Path::new(&path_str)).await?;
            Ok(json!({ "bytes_written": bytes_written }))
        }
        "state_set" => {
            let session_id = str_field(&args, "session_id")?;
            let key = str_field(&args, "key")?;
            let value = args
                .get("value")
                .cloned()
                .ok_or_else(|| BridgeError::InvalidArgument("missing `value`".into()))?;
            let clock = tool_surface.state_set(&session_id, key, value).await?;
            Ok(json!({ "clock": clock }))
        }
        "state_get" => {
            let session_id = str_field(&args, "session_id")?;
            let key = str_field(&args, "key")?;
            Ok(json!({ "value": tool_surface.state_get(&session_id, &key).await? }))
        }
        "state_sync" => {
            let session_id = str_field(&args, "session_id")?;
            tool_surface.state_sync(&session_id).await?;
            Ok(json!({}))
        }
        other => Err(BridgeError::InvalidArgument(format!("unknown tool `{other}`"))),
    }
}
