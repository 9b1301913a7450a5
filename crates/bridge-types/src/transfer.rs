//! Tool-facing file-transfer summaries. The live, mutable transfer state
//! machines live in `bridge-core`; these are the read-only views the tool
//! surface returns.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Offered,
    Transferring,
    Receiving,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingTransferSummary {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub target_uuid: String,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub total_bytes: u64,
    pub total_chunks: u32,
    pub acked_chunks: u32,
    pub retries_total: u32,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingTransferSummary {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub from_uuid: String,
    pub from_stream_id: Option<String>,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub total_bytes: u64,
    pub total_chunks: u32,
    pub received_bytes: u64,
    pub received_chunks: u32,
    pub spooled: bool,
    pub spool_path: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}
