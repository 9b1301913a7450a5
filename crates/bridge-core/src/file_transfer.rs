//! Chunked file transfer: one outgoing state machine per transfer we are
//! sending, one incoming state machine per transfer someone is sending us.
//! Exactly one chunk is ever in flight per outgoing transfer (no pipelining):
//! the sender waits for `file.ack`/`file.nack` before advancing, which keeps
//! the retry/resume logic a straight line instead of a window protocol.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bridge_transport::PeerTransport;
use bridge_types::{
    BridgeEvent, Envelope, EnvelopeKind, FileAcceptPayload, FileAckPayload, FileCancelPayload,
    FileChunkPayload, FileCompleteAckPayload, FileCompletePayload, FileNackPayload,
    FileOfferPayload, FileResumeReqPayload, FileResumeStatePayload, IncomingTransferSummary,
    OutgoingTransferSummary, SessionConfig, TransferDirection, TransferStatus,
};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, AsyncSeekExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::event_queue::EventQueue;
use crate::protocol_bus::ProtocolEventBus;
use crate::time::{new_nonce, now_ms};

fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

struct OutgoingTransfer {
    transfer_id: String,
    status: TransferStatus,
    target_uuid: String,
    name: Option<String>,
    mime: Option<String>,
    data: Vec<u8>,
    chunk_size: u32,
    total_chunks: u32,
    file_hash: String,
    next_seq: u32,
    retries_for_current: u32,
    retries_total: u32,
    last_error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
    /// Per-transfer overrides of the session defaults; set once from the
    /// `file_send` call that created this transfer.
    ack_timeout_ms: u64,
    max_retries: u32,
}

impl OutgoingTransfer {
    fn offer_timeout_ms(&self) -> u64 {
        self.ack_timeout_ms.max(1_000)
    }

    fn complete_timeout_ms(&self) -> u64 {
        self.ack_timeout_ms.saturating_mul(2)
    }
}

impl OutgoingTransfer {
    fn summary(&self) -> OutgoingTransferSummary {
        OutgoingTransferSummary {
            transfer_id: self.transfer_id.clone(),
            status: self.status,
            target_uuid: self.target_uuid.clone(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            total_bytes: self.data.len() as u64,
            total_chunks: self.total_chunks,
            acked_chunks: self.next_seq,
            retries_total: self.retries_total,
            last_error: self.last_error.clone(),
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        }
    }

    fn chunk(&self, seq: u32) -> &[u8] {
        let start = seq as usize * self.chunk_size as usize;
        let end = (start + self.chunk_size as usize).min(self.data.len());
        &self.data[start..end]
    }
}

/// Per-call overrides accepted by [`FileTransferEngine::send_file`]; any
/// field left `None` falls back to the session's configured default.
#[derive(Debug, Default, Clone)]
pub struct FileSendOptions {
    pub chunk_bytes: Option<u32>,
    pub ack_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub transfer_id: Option<String>,
}

enum IncomingStorage {
    Memory(Vec<Option<Vec<u8>>>),
    Spool { path: PathBuf, file: tokio::fs::File },
}

struct IncomingTransfer {
    transfer_id: String,
    status: TransferStatus,
    from_uuid: String,
    from_stream_id: Option<String>,
    name: Option<String>,
    mime: Option<String>,
    total_bytes: u64,
    chunk_size: u32,
    total_chunks: u32,
    expected_file_hash: String,
    received_seqs: HashSet<u32>,
    received_bytes: u64,
    running_hash: Sha256,
    storage: IncomingStorage,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl IncomingTransfer {
    fn summary(&self) -> IncomingTransferSummary {
        let (spooled, spool_path) = match &self.storage {
            IncomingStorage::Memory(_) => (false, None),
            IncomingStorage::Spool { path, .. } => (true, Some(path.display().to_string())),
        };
        IncomingTransferSummary {
            transfer_id: self.transfer_id.clone(),
            status: self.status,
            from_uuid: self.from_uuid.clone(),
            from_stream_id: self.from_stream_id.clone(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            total_bytes: self.total_bytes,
            total_chunks: self.total_chunks,
            received_bytes: self.received_bytes,
            received_chunks: self.received_seqs.len() as u32,
            spooled,
            spool_path,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        }
    }
}

pub struct FileTransferEngine {
    config: Arc<SessionConfig>,
    transport: Arc<dyn PeerTransport>,
    events: Arc<EventQueue>,
    bus: Arc<ProtocolEventBus>,
    outgoing: RwLock<HashMap<String, Arc<Mutex<OutgoingTransfer>>>>,
    incoming: RwLock<HashMap<String, Arc<Mutex<IncomingTransfer>>>>,
    completed_outgoing: Mutex<VecDeque<String>>,
    completed_incoming: Mutex<VecDeque<String>>,
}

impl FileTransferEngine {
    pub fn new(
        config: Arc<SessionConfig>,
        transport: Arc<dyn PeerTransport>,
        events: Arc<EventQueue>,
        bus: Arc<ProtocolEventBus>,
    ) -> Self {
        Self {
            config,
            transport,
            events,
            bus,
            outgoing: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
            completed_outgoing: Mutex::new(VecDeque::new()),
            completed_incoming: Mutex::new(VecDeque::new()),
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

    async fn send(&self, target: &str, env: &Envelope) {
        let value = serde_json::to_value(env).expect("Envelope always serializes");
        if let Err(e) = self.transport.send_data(&value, Some(target)).await {
            warn!(target = target, kind = env.kind.wire_str(), error = %e, "file transfer send failed");
        }
    }

    fn matches(env: &Envelope, kind: EnvelopeKind, transfer_id: &str) -> bool {
        env.kind == kind
            && env
                .payload
                .get("transfer_id")
                .and_then(serde_json::Value::as_str)
                == Some(transfer_id)
    }

    // -----------------------------------------------------------------
    // Outgoing
    // -----------------------------------------------------------------

    /// Begin sending `data` to `target_uuid`; spawns the state-machine task
    /// and returns the new transfer's id immediately.
    pub async fn send_file(
        self: &Arc<Self>,
        target_uuid: String,
        data: Vec<u8>,
        name: Option<String>,
        mime: Option<String>,
        opts: FileSendOptions,
    ) -> BridgeResult<String> {
        if data.len() as u64 > self.config.file_max_bytes {
            return Err(BridgeError::InvalidArgument(format!(
                "file of {} bytes exceeds file_max_bytes ({})",
                data.len(),
                self.config.file_max_bytes
            )));
        }
        let transfer_id = opts.transfer_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        if self.outgoing.read().await.contains_key(&transfer_id) {
            return Err(BridgeError::InvalidArgument(format!(
                "transfer id `{transfer_id}` is already in use"
            )));
        }
        let chunk_size = opts.chunk_bytes.unwrap_or(self.config.file_chunk_bytes);
        let ack_timeout_ms = opts.ack_timeout_ms.unwrap_or(self.config.file_ack_timeout_ms);
        let max_retries = opts.max_retries.unwrap_or(self.config.file_max_retries);
        let total_chunks = ((data.len() as u64 + chunk_size as u64 - 1) / chunk_size as u64).max(1) as u32;
        let file_hash = sha256_hex(&data);
        let now = now_ms();

        let transfer = OutgoingTransfer {
            transfer_id: transfer_id.clone(),
            status: TransferStatus::Offered,
            target_uuid,
            name,
            mime,
            data,
            chunk_size,
            total_chunks,
            file_hash,
            next_seq: 0,
            retries_for_current: 0,
            retries_total: 0,
            last_error: None,
            created_at_ms: now,
            updated_at_ms: now,
            ack_timeout_ms,
            max_retries,
        };
        let handle = Arc::new(Mutex::new(transfer));
        self.outgoing
            .write()
            .await
            .insert(transfer_id.clone(), handle.clone());

        let this = self.clone();
        let id = transfer_id.clone();
        tokio::spawn(async move {
            this.run_outgoing(id, handle).await;
        });

        Ok(transfer_id)
    }

    /// Start a transfer and wait for it to reach a terminal status, then
    /// return its final summary. Used by the tool surface, which reports a
    /// transfer summary on completion rather than a bare transfer id.
    pub async fn send_file_and_await(
        self: &Arc<Self>,
        target_uuid: String,
        data: Vec<u8>,
        name: Option<String>,
        mime: Option<String>,
        opts: FileSendOptions,
    ) -> BridgeResult<OutgoingTransferSummary> {
        let transfer_id = self.send_file(target_uuid, data, name, mime, opts).await?;
        self.await_outgoing_terminal(&transfer_id).await
    }

    async fn await_outgoing_terminal(&self, transfer_id: &str) -> BridgeResult<OutgoingTransferSummary> {
        loop {
            let summary = self
                .outgoing_summary(transfer_id)
                .await
                .ok_or_else(|| BridgeError::UnknownTransfer(transfer_id.to_string()))?;
            if !matches!(summary.status, TransferStatus::Offered | TransferStatus::Transferring) {
                return Ok(summary);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn run_outgoing(self: Arc<Self>, transfer_id: String, handle: Arc<Mutex<OutgoingTransfer>>) {
        let (target, offer_timeout_ms, offer_payload) = {
            let t = handle.lock().await;
            (
                t.target_uuid.clone(),
                t.offer_timeout_ms(),
                FileOfferPayload {
                    transfer_id: transfer_id.clone(),
                    name: t.name.clone(),
                    mime: t.mime.clone(),
                    total_bytes: t.data.len() as u64,
                    total_chunks: t.total_chunks,
                    chunk_bytes: t.chunk_size,
                    file_hash: t.file_hash.clone(),
                },
            )
        };

        let since = self.bus.cursor();
        let env = self.envelope(
            EnvelopeKind::FileOffer,
            serde_json::to_value(offer_payload).expect("FileOfferPayload always serializes"),
        );
        self.send(&target, &env).await;

        let timeout = Duration::from_millis(offer_timeout_ms);
        let tid = transfer_id.clone();
        let accept = self
            .bus
            .wait_for(since, timeout, move |e| Self::matches(e, EnvelopeKind::FileAccept, &tid))
            .await;

        let accept = match accept {
            Some(e) => e,
            None => {
                self.fail_outgoing(&handle, &transfer_id, "offer timed out waiting for file.accept").await;
                return;
            }
        };
        let accept_payload: FileAcceptPayload = match accept.decode_payload() {
            Ok(p) => p,
            Err(_) => {
                self.fail_outgoing(&handle, &transfer_id, "malformed file.accept payload").await;
                return;
            }
        };

        {
            let mut t = handle.lock().await;
            t.status = TransferStatus::Transferring;
            t.next_seq = accept_payload.next_seq;
            t.updated_at_ms = now_ms();
        }

        if self.drive_chunks(&transfer_id, &handle, &target).await.is_err() {
            return;
        }
        self.finish_outgoing(&transfer_id, &handle, &target).await;
    }

    /// Send every remaining chunk, retrying on timeout/nack up to
    /// `file_max_retries` times. Returns `Err` once the transfer has been
    /// marked `Failed`.
    async fn drive_chunks(
        &self,
        transfer_id: &str,
        handle: &Arc<Mutex<OutgoingTransfer>>,
        target: &str,
    ) -> Result<(), ()> {
        loop {
            let (next_seq, total_chunks, chunk_bytes, retries, ack_timeout_ms, max_retries) = {
                let t = handle.lock().await;
                if t.next_seq >= t.total_chunks {
                    return Ok(());
                }
                (
                    t.next_seq,
                    t.total_chunks,
                    t.chunk(t.next_seq).to_vec(),
                    t.retries_for_current,
                    t.ack_timeout_ms,
                    t.max_retries,
                )
            };
            let _ = total_chunks;

            let chunk_hash = sha256_hex(&chunk_bytes);
            let payload = FileChunkPayload {
                transfer_id: transfer_id.to_string(),
                seq: next_seq,
                data_base64: BASE64.encode(&chunk_bytes),
                chunk_hash,
            };
            let since = self.bus.cursor();
            let env = self.envelope(
                EnvelopeKind::FileChunk,
                serde_json::to_value(payload).expect("FileChunkPayload always serializes"),
            );
            self.send(target, &env).await;

            let timeout = Duration::from_millis(ack_timeout_ms);
            let tid = transfer_id.to_string();
            let reply = self
                .bus
                .wait_for(since, timeout, move |e| {
                    Self::matches(e, EnvelopeKind::FileAck, &tid) || Self::matches(e, EnvelopeKind::FileNack, &tid)
                })
                .await;

            match reply {
                None => {
                    if retries + 1 > max_retries {
                        self.fail_outgoing(handle, transfer_id, "chunk retries exhausted (timeout)").await;
                        return Err(());
                    }
                    let mut t = handle.lock().await;
                    t.retries_for_current += 1;
                    t.retries_total += 1;
                    t.updated_at_ms = now_ms();
                }
                Some(env) if env.kind == EnvelopeKind::FileAck => {
                    let ack: FileAckPayload = match env.decode_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let mut t = handle.lock().await;
                    t.next_seq = ack.next_seq;
                    t.retries_for_current = 0;
                    t.updated_at_ms = now_ms();
                }
                Some(env) => {
                    let nack: FileNackPayload = match env.decode_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if retries + 1 > max_retries {
                        self.fail_outgoing(handle, transfer_id, &format!("chunk retries exhausted ({})", nack.reason)).await;
                        return Err(());
                    }
                    let mut t = handle.lock().await;
                    t.next_seq = nack.expected_seq;
                    t.retries_for_current += 1;
                    t.retries_total += 1;
                    t.updated_at_ms = now_ms();
                }
            }
        }
    }

    async fn finish_outgoing(&self, transfer_id: &str, handle: &Arc<Mutex<OutgoingTransfer>>, target: &str) {
        let (total_bytes, file_hash, complete_timeout_ms) = {
            let t = handle.lock().await;
            (t.data.len() as u64, t.file_hash.clone(), t.complete_timeout_ms())
        };

        let since = self.bus.cursor();
        let env = self.envelope(
            EnvelopeKind::FileComplete,
            serde_json::to_value(FileCompletePayload {
                transfer_id: transfer_id.to_string(),
                total_bytes,
                file_hash,
            })
            .expect("FileCompletePayload always serializes"),
        );
        self.send(target, &env).await;

        let timeout = Duration::from_millis(complete_timeout_ms);
        let tid = transfer_id.to_string();
        let ack = self
            .bus
            .wait_for(since, timeout, move |e| Self::matches(e, EnvelopeKind::FileCompleteAck, &tid))
            .await;

        if ack.is_none() {
            self.recover_from_lost_complete_ack(transfer_id, handle, target).await;
            return;
        }

        {
            let mut t = handle.lock().await;
            t.status = TransferStatus::Completed;
            t.updated_at_ms = now_ms();
        }
        self.retire_outgoing(transfer_id).await;
    }

    /// `file.complete_ack` never arrived. The bytes may well have landed
    /// (only the ack was lost), so send a single `file.resume_req` and trust
    /// the receiver's reported progress: `next_seq >= total_chunks` means it
    /// already has everything and this transfer is done; anything less means
    /// it genuinely isn't, and the transfer is marked failed.
    async fn recover_from_lost_complete_ack(
        &self,
        transfer_id: &str,
        handle: &Arc<Mutex<OutgoingTransfer>>,
        target: &str,
    ) {
        let ack_timeout_ms = handle.lock().await.ack_timeout_ms;
        let resume = self.request_resume_state(transfer_id, target, ack_timeout_ms).await;
        let total_chunks = handle.lock().await.total_chunks;

        match resume {
            Ok(state) if state.next_seq >= total_chunks => {
                {
                    let mut t = handle.lock().await;
                    t.status = TransferStatus::Completed;
                    t.updated_at_ms = now_ms();
                }
                self.retire_outgoing(transfer_id).await;
            }
            Ok(_) => {
                self.fail_outgoing(handle, transfer_id, "complete_ack timed out and receiver is not fully caught up").await;
            }
            Err(e) => {
                self.fail_outgoing(handle, transfer_id, &format!("complete_ack timed out and resume probe failed: {e}")).await;
            }
        }
    }

    /// Send one `file.resume_req` and wait for the matching `file.resume_state`.
    async fn request_resume_state(&self, transfer_id: &str, target: &str, timeout_ms: u64) -> BridgeResult<FileResumeStatePayload> {
        let since = self.bus.cursor();
        let env = self.envelope(
            EnvelopeKind::FileResumeReq,
            serde_json::to_value(FileResumeReqPayload { transfer_id: transfer_id.to_string() })
                .expect("FileResumeReqPayload always serializes"),
        );
        self.send(target, &env).await;

        let timeout = Duration::from_millis(timeout_ms);
        let tid = transfer_id.to_string();
        let reply = self
            .bus
            .wait_for(since, timeout, move |e| Self::matches(e, EnvelopeKind::FileResumeState, &tid))
            .await
            .ok_or_else(|| BridgeError::Internal("resume request timed out".into()))?;

        reply
            .decode_payload()
            .map_err(|e| BridgeError::Internal(format!("malformed file.resume_state: {e}")))
    }

    async fn fail_outgoing(&self, handle: &Arc<Mutex<OutgoingTransfer>>, transfer_id: &str, reason: &str) {
        {
            let mut t = handle.lock().await;
            t.status = TransferStatus::Failed;
            t.last_error = Some(reason.to_string());
            t.updated_at_ms = now_ms();
        }
        self.events.push(BridgeEvent::FileTransferFailed {
            ts: now_ms(),
            transfer_id: transfer_id.to_string(),
            reason: reason.to_string(),
        });
    }

    async fn retire_outgoing(&self, transfer_id: &str) {
        let mut completed = self.completed_outgoing.lock().await;
        completed.push_back(transfer_id.to_string());
        if completed.len() > self.config.completed_transfer_cap {
            if let Some(evicted) = completed.pop_front() {
                self.outgoing.write().await.remove(&evicted);
            }
        }
    }

    /// Resume a stalled outgoing transfer. When `start_seq` is given, the
    /// state machine is reset to that sequence number directly with no
    /// network round trip; otherwise the receiver is asked for its current
    /// progress via `file.resume_req`. Waits for the retried transfer to
    /// reach a terminal status before returning its summary.
    pub async fn resume_outgoing(self: &Arc<Self>, transfer_id: &str, start_seq: Option<u32>) -> BridgeResult<OutgoingTransferSummary> {
        let handle = self
            .outgoing
            .read()
            .await
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownTransfer(transfer_id.to_string()))?;

        let target = handle.lock().await.target_uuid.clone();
        let next_seq = match start_seq {
            Some(seq) => seq,
            None => {
                let ack_timeout_ms = handle.lock().await.ack_timeout_ms;
                self.request_resume_state(transfer_id, &target, ack_timeout_ms).await?.next_seq
            }
        };

        {
            let mut t = handle.lock().await;
            t.next_seq = next_seq;
            t.status = TransferStatus::Transferring;
            t.retries_for_current = 0;
            t.updated_at_ms = now_ms();
        }

        let this = self.clone();
        let id = transfer_id.to_string();
        tokio::spawn(async move {
            if this.drive_chunks(&id, &handle, &target).await.is_ok() {
                this.finish_outgoing(&id, &handle, &target).await;
            }
        });
        self.await_outgoing_terminal(transfer_id).await
    }

    pub async fn outgoing_summary(&self, transfer_id: &str) -> Option<OutgoingTransferSummary> {
        let handle = self.outgoing.read().await.get(transfer_id).cloned()?;
        Some(handle.lock().await.summary())
    }

    // -----------------------------------------------------------------
    // Incoming
    // -----------------------------------------------------------------

    pub async fn handle_file_offer(&self, from_uuid: &str, from_stream_id: Option<&str>, env: &Envelope) {
        let payload: FileOfferPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = from_uuid, error = %e, "malformed file.offer");
                return;
            }
        };

        if self.incoming.read().await.contains_key(&payload.transfer_id) {
            debug!(transfer_id = %payload.transfer_id, "duplicate file.offer, reusing existing record");
            return;
        }

        if payload.total_bytes > self.config.file_max_bytes {
            self.events.push(BridgeEvent::FileTransferFailed {
                ts: now_ms(),
                transfer_id: payload.transfer_id.clone(),
                reason: format!(
                    "offer of {} bytes exceeds file_max_bytes ({})",
                    payload.total_bytes, self.config.file_max_bytes
                ),
            });
            return;
        }

        let storage = if payload.total_bytes >= self.config.spool_threshold_bytes {
            match self.open_spool_file(&payload.transfer_id).await {
                Some((path, file)) => IncomingStorage::Spool { path, file },
                None => IncomingStorage::Memory(vec![None; payload.total_chunks as usize]),
            }
        } else {
            IncomingStorage::Memory(vec![None; payload.total_chunks as usize])
        };

        let now = now_ms();
        let transfer = IncomingTransfer {
            transfer_id: payload.transfer_id.clone(),
            status: TransferStatus::Receiving,
            from_uuid: from_uuid.to_string(),
            from_stream_id: from_stream_id.map(|s| s.to_string()),
            name: payload.name,
            mime: payload.mime,
            total_bytes: payload.total_bytes,
            chunk_size: payload.chunk_bytes,
            total_chunks: payload.total_chunks,
            expected_file_hash: payload.file_hash,
            received_seqs: HashSet::new(),
            received_bytes: 0,
            running_hash: Sha256::new(),
            storage,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.incoming
            .write()
            .await
            .insert(payload.transfer_id.clone(), Arc::new(Mutex::new(transfer)));

        let env_out = self.envelope(
            EnvelopeKind::FileAccept,
            serde_json::to_value(FileAcceptPayload { transfer_id: payload.transfer_id, next_seq: 0 })
                .expect("FileAcceptPayload always serializes"),
        );
        self.send(from_uuid, &env_out).await;
    }

    async fn open_spool_file(&self, transfer_id: &str) -> Option<(PathBuf, tokio::fs::File)> {
        let dir = self.config.spool_dir.as_ref()?;
        let path = PathBuf::from(dir).join(format!("{transfer_id}.part"));
        match tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
        {
            Ok(file) => Some((path, file)),
            Err(e) => {
                warn!(transfer_id, error = %e, "failed to open spool file, falling back to memory");
                None
            }
        }
    }

    pub async fn handle_file_chunk(&self, from_uuid: &str, env: &Envelope) {
        let payload: FileChunkPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = from_uuid, error = %e, "malformed file.chunk");
                return;
            }
        };
        let handle = match self.incoming.read().await.get(&payload.transfer_id).cloned() {
            Some(h) => h,
            None => {
                debug!(transfer_id = %payload.transfer_id, "file.chunk for unknown transfer");
                return;
            }
        };

        let data = match BASE64.decode(&payload.data_base64) {
            Ok(d) => d,
            Err(_) => {
                self.send_nack(from_uuid, &payload.transfer_id, 0, "chunk is not valid base64").await;
                return;
            }
        };
        if sha256_hex(&data) != payload.chunk_hash {
            let expected = handle.lock().await.received_seqs.len() as u32;
            self.send_nack(from_uuid, &payload.transfer_id, expected, "chunk hash mismatch").await;
            return;
        }

        let mut t = handle.lock().await;
        if t.from_uuid != from_uuid {
            drop(t);
            self.send_nack(from_uuid, &payload.transfer_id, 0, "transfer owned by a different peer").await;
            return;
        }
        if t.received_seqs.contains(&payload.seq) {
            // Already have it (retransmit after a dropped ack); just re-ack.
            let next_seq = t.received_seqs.len() as u32;
            let received_bytes = t.received_bytes;
            drop(t);
            self.send_ack(from_uuid, &payload.transfer_id, payload.seq, next_seq, received_bytes).await;
            return;
        }
        let expected_seq = t.received_seqs.len() as u32;
        if payload.seq != expected_seq {
            let err = "out of order chunk".to_string();
            drop(t);
            self.send_nack(from_uuid, &payload.transfer_id, expected_seq, &err).await;
            return;
        }

        if let Err(e) = Self::store_chunk(&mut t, payload.seq, &data).await {
            t.status = TransferStatus::Failed;
            let reason = format!("failed writing chunk to spool file: {e}");
            t.updated_at_ms = now_ms();
            drop(t);
            self.events.push(BridgeEvent::FileTransferFailed {
                ts: now_ms(),
                transfer_id: payload.transfer_id.clone(),
                reason,
            });
            return;
        }
        t.running_hash.update(&data);
        t.received_seqs.insert(payload.seq);
        t.received_bytes += data.len() as u64;
        t.updated_at_ms = now_ms();
        let next_seq = t.received_seqs.len() as u32;
        let received_bytes = t.received_bytes;
        drop(t);

        self.send_ack(from_uuid, &payload.transfer_id, payload.seq, next_seq, received_bytes).await;
    }

    async fn store_chunk(t: &mut IncomingTransfer, seq: u32, data: &[u8]) -> std::io::Result<()> {
        match &mut t.storage {
            IncomingStorage::Memory(slots) => {
                if let Some(slot) = slots.get_mut(seq as usize) {
                    *slot = Some(data.to_vec());
                }
                Ok(())
            }
            IncomingStorage::Spool { file, .. } => {
                let offset = seq as u64 * t.chunk_size as u64;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                file.write_all(data).await
            }
        }
    }

    async fn send_ack(&self, target: &str, transfer_id: &str, seq: u32, next_seq: u32, received_bytes: u64) {
        let env = self.envelope(
            EnvelopeKind::FileAck,
            serde_json::to_value(FileAckPayload {
                transfer_id: transfer_id.to_string(),
                seq,
                next_seq,
                received_bytes,
            })
            .expect("FileAckPayload always serializes"),
        );
        self.send(target, &env).await;
    }

    async fn send_nack(&self, target: &str, transfer_id: &str, expected_seq: u32, reason: &str) {
        let env = self.envelope(
            EnvelopeKind::FileNack,
            serde_json::to_value(FileNackPayload {
                transfer_id: transfer_id.to_string(),
                expected_seq,
                reason: reason.to_string(),
            })
            .expect("FileNackPayload always serializes"),
        );
        self.send(target, &env).await;
    }

    pub async fn handle_file_complete(&self, from_uuid: &str, env: &Envelope) {
        let payload: FileCompletePayload = match env.decode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = from_uuid, error = %e, "malformed file.complete");
                return;
            }
        };
        let handle = match self.incoming.read().await.get(&payload.transfer_id).cloned() {
            Some(h) => h,
            None => return,
        };

        let (ok, computed_hash) = {
            let t = handle.lock().await;
            let all_received = t.received_seqs.len() as u32 == t.total_chunks;
            let computed = hex::encode(t.running_hash.clone().finalize());
            let ok = all_received
                && t.received_bytes == payload.total_bytes
                && computed == payload.file_hash
                && computed == t.expected_file_hash;
            (ok, computed)
        };

        if !ok {
            let mut t = handle.lock().await;
            t.status = TransferStatus::Failed;
            t.updated_at_ms = now_ms();
            drop(t);
            self.events.push(BridgeEvent::FileTransferFailed {
                ts: now_ms(),
                transfer_id: payload.transfer_id.clone(),
                reason: format!("integrity check failed (computed {computed_hash})"),
            });
            return;
        }

        {
            let mut t = handle.lock().await;
            if let IncomingStorage::Spool { file, .. } = &mut t.storage {
                let _ = file.flush().await;
            }
            t.status = TransferStatus::Completed;
            t.updated_at_ms = now_ms();
        }

        self.events.push(BridgeEvent::FileReceived {
            ts: now_ms(),
            transfer_id: payload.transfer_id.clone(),
            from_uuid: from_uuid.to_string(),
            total_bytes: payload.total_bytes,
        });

        let mut completed = self.completed_incoming.lock().await;
        completed.push_back(payload.transfer_id.clone());
        if completed.len() > self.config.completed_transfer_cap {
            if let Some(evicted) = completed.pop_front() {
                if let Some(old) = self.incoming.write().await.remove(&evicted) {
                    Self::cleanup_spool(&old, self.config.keep_spool_files).await;
                }
            }
        }
        drop(completed);

        let env_out = self.envelope(
            EnvelopeKind::FileCompleteAck,
            serde_json::to_value(FileCompleteAckPayload {
                transfer_id: payload.transfer_id,
                file_hash: computed_hash,
                total_bytes: payload.total_bytes,
            })
            .expect("FileCompleteAckPayload always serializes"),
        );
        self.send(from_uuid, &env_out).await;
    }

    async fn cleanup_spool(handle: &Arc<Mutex<IncomingTransfer>>, keep: bool) {
        if keep {
            return;
        }
        let t = handle.lock().await;
        if let IncomingStorage::Spool { path, .. } = &t.storage {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    pub async fn handle_resume_req(&self, from_uuid: &str, env: &Envelope) {
        let payload: FileResumeReqPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(_) => return,
        };
        let (next_seq, status) = match self.incoming.read().await.get(&payload.transfer_id).cloned() {
            Some(handle) => {
                let t = handle.lock().await;
                (t.received_seqs.len() as u32, format!("{:?}", t.status).to_lowercase())
            }
            None => (0, "unknown_transfer".to_string()),
        };
        let env_out = self.envelope(
            EnvelopeKind::FileResumeState,
            serde_json::to_value(FileResumeStatePayload {
                transfer_id: payload.transfer_id,
                next_seq,
                status,
            })
            .expect("FileResumeStatePayload always serializes"),
        );
        self.send(from_uuid, &env_out).await;
    }

    pub async fn handle_file_cancel(&self, from_uuid: &str, env: &Envelope) {
        let payload: FileCancelPayload = match env.decode_payload() {
            Ok(p) => p,
            Err(_) => return,
        };
        if let Some(handle) = self.incoming.read().await.get(&payload.transfer_id).cloned() {
            let mut t = handle.lock().await;
            t.status = TransferStatus::Cancelled;
            t.updated_at_ms = now_ms();
            drop(t);
            Self::cleanup_spool(&handle, false).await;
        }
        self.events.push(BridgeEvent::FileTransferCancelled {
            ts: now_ms(),
            transfer_id: payload.transfer_id,
        });
        let _ = from_uuid;
    }

    pub async fn incoming_summary(&self, transfer_id: &str) -> Option<IncomingTransferSummary> {
        let handle = self.incoming.read().await.get(transfer_id).cloned()?;
        Some(handle.lock().await.summary())
    }

    /// Read back the full bytes of a completed incoming transfer.
    pub async fn read_incoming_bytes(&self, transfer_id: &str) -> BridgeResult<Vec<u8>> {
        let handle = self
            .incoming
            .read()
            .await
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownTransfer(transfer_id.to_string()))?;
        let mut t = handle.lock().await;
        if t.status != TransferStatus::Completed {
            return Err(BridgeError::InvalidArgument(format!(
                "transfer {transfer_id} is not complete"
            )));
        }
        match &mut t.storage {
            IncomingStorage::Memory(slots) => {
                let mut out = Vec::with_capacity(t.total_bytes as usize);
                for slot in slots.iter() {
                    match slot {
                        Some(bytes) => out.extend_from_slice(bytes),
                        None => return Err(BridgeError::Internal("missing chunk in completed transfer".into())),
                    }
                }
                Ok(out)
            }
            IncomingStorage::Spool { file, .. } => {
                file.seek(std::io::SeekFrom::Start(0)).await?;
                let mut out = Vec::with_capacity(t.total_bytes as usize);
                tokio::io::AsyncReadExt::read_to_end(file, &mut out).await?;
                Ok(out)
            }
        }
    }

    pub async fn save_incoming_to_path(&self, transfer_id: &str, dest: &std::path::Path) -> BridgeResult<u64> {
        let bytes = self.read_incoming_bytes(transfer_id).await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    pub async fn list_transfers(&self, direction: TransferDirection) -> (Vec<OutgoingTransferSummary>, Vec<IncomingTransferSummary>) {
        let mut outgoing = Vec::new();
        let mut incoming = Vec::new();
        if matches!(direction, TransferDirection::Outgoing | TransferDirection::All) {
            for handle in self.outgoing.read().await.values() {
                outgoing.push(handle.lock().await.summary());
            }
        }
        if matches!(direction, TransferDirection::Incoming | TransferDirection::All) {
            for handle in self.incoming.read().await.values() {
                incoming.push(handle.lock().await.summary());
            }
        }
        (outgoing, incoming)
    }
}
