//! Stdio transport: newline-delimited JSON-RPC, one request/response per
//! line, matching how MCP clients talk to a locally-spawned server process.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error};

use crate::rpc::{parse_error_response, Dispatcher, RpcRequest};

pub async fn run(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!(bytes = line.len(), "stdio: request line received");

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(req) => dispatcher.dispatch(req).await,
            Err(e) => {
                error!(error = %e, "stdio: malformed JSON-RPC request");
                Some(parse_error_response(e.to_string()))
            }
        };

        let Some(response) = response else {
            continue;
        };
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}
