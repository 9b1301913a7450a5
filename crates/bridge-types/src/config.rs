//! Immutable per-session configuration.

use serde::{Deserialize, Serialize};

fn default_heartbeat_ms() -> u64 {
    15_000
}
fn default_reconnect_ms() -> u64 {
    1_000
}
fn default_max_reconnect_ms() -> u64 {
    30_000
}
fn default_ttl_secs() -> i64 {
    3_600
}
fn default_file_chunk_bytes() -> u32 {
    16 * 1024
}
fn default_file_max_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_file_ack_timeout_ms() -> u64 {
    5_000
}
fn default_file_max_retries() -> u32 {
    5
}
fn default_state_max_keys() -> usize {
    10_000
}
fn default_state_max_snapshot_entries() -> usize {
    2_000
}
fn default_event_queue_cap() -> usize {
    2_000
}
fn default_completed_transfer_cap() -> usize {
    256
}

/// Immutable configuration for one [`BridgeSession`](../bridge_core/struct.BridgeSession.html).
/// Built once at `connect` time; nothing here changes for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub signalling_endpoint: String,
    pub room: String,
    pub stream_id: String,
    #[serde(default)]
    pub target_stream_id: Option<String>,
    #[serde(default)]
    pub signalling_password: Option<String>,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,
    #[serde(default = "default_max_reconnect_ms")]
    pub max_reconnect_ms: u64,

    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub join_token: Option<String>,
    #[serde(default)]
    pub join_token_secret: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub join_token_ttl_secs: i64,
    #[serde(default)]
    pub enforce_join_token: bool,
    #[serde(default)]
    pub allow_peer_stream_ids: Vec<String>,

    #[serde(default = "default_file_chunk_bytes")]
    pub file_chunk_bytes: u32,
    #[serde(default = "default_file_max_bytes")]
    pub file_max_bytes: u64,
    #[serde(default = "default_file_ack_timeout_ms")]
    pub file_ack_timeout_ms: u64,
    #[serde(default = "default_file_max_retries")]
    pub file_max_retries: u32,
    #[serde(default = "default_completed_transfer_cap")]
    pub completed_transfer_cap: usize,

    #[serde(default)]
    pub require_session_mac: bool,

    #[serde(default)]
    pub spool_dir: Option<String>,
    #[serde(default = "default_spool_threshold_bytes")]
    pub spool_threshold_bytes: u64,
    #[serde(default)]
    pub keep_spool_files: bool,

    #[serde(default = "default_state_max_keys")]
    pub state_max_keys: usize,
    #[serde(default = "default_state_max_snapshot_entries")]
    pub state_max_snapshot_entries: usize,

    #[serde(default = "default_event_queue_cap")]
    pub event_queue_cap: usize,
}

fn default_spool_threshold_bytes() -> u64 {
    8 * 1024 * 1024
}

impl SessionConfig {
    /// `max(ack_timeout_ms, 1000)` used for the initial `file.offer` wait.
    pub fn offer_timeout_ms(&self) -> u64 {
        self.file_ack_timeout_ms.max(1_000)
    }

    /// `2 * ack_timeout_ms` used for the `file.complete_ack` wait.
    pub fn complete_timeout_ms(&self) -> u64 {
        self.file_ack_timeout_ms.saturating_mul(2)
    }
}
