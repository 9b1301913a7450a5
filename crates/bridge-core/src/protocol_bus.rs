//! Cursor-plus-broadcast wait primitive used by the file-transfer and
//! handshake engines to await a matching reply envelope without losing a
//! wakeup that arrives between "I checked" and "I started waiting".

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bridge_types::Envelope;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 4096;

pub struct ProtocolEventBus {
    tx: broadcast::Sender<(u64, Envelope)>,
    cursor: AtomicU64,
}

impl ProtocolEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            cursor: AtomicU64::new(0),
        }
    }

    /// Cursor value as of right now. Callers capture this before issuing a
    /// request so `wait_for` only matches replies that arrive afterward.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn publish(&self, envelope: Envelope) {
        let c = self.cursor.fetch_add(1, Ordering::SeqCst) + 1;
        // No receivers is a normal state (nobody is waiting); ignore the error.
        let _ = self.tx.send((c, envelope));
    }

    /// Wait for the first envelope published after `since` matching `pred`,
    /// or `None` on timeout.
    pub async fn wait_for<F>(&self, since: u64, timeout: Duration, pred: F) -> Option<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok((cursor, envelope))) => {
                    if cursor > since && pred(&envelope) {
                        return Some(envelope);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => return None,
            }
        }
    }
}

impl Default for ProtocolEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_types::EnvelopeKind;

    fn env(kind: EnvelopeKind, transfer_id: &str) -> Envelope {
        Envelope::new(
            kind,
            0,
            "n".into(),
            "room1",
            "agent_a",
            serde_json::json!({"transfer_id": transfer_id}),
        )
    }

    #[tokio::test]
    async fn wait_for_matches_published_after_cursor() {
        let bus = ProtocolEventBus::new();
        let since = bus.cursor();
        let bus2 = std::sync::Arc::new(bus);
        let waiter = {
            let bus = bus2.clone();
            tokio::spawn(async move {
                bus.wait_for(since, Duration::from_secs(2), |e| e.kind == EnvelopeKind::FileAck)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus2.publish(env(EnvelopeKind::FileAck, "t1"));
        let got = waiter.await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let bus = ProtocolEventBus::new();
        let since = bus.cursor();
        let got = bus
            .wait_for(since, Duration::from_millis(50), |_| true)
            .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn wait_for_ignores_events_before_cursor() {
        let bus = ProtocolEventBus::new();
        bus.publish(env(EnvelopeKind::FileAck, "stale"));
        let since = bus.cursor();
        let got = bus
            .wait_for(since, Duration::from_millis(50), |_| true)
            .await;
        assert!(got.is_none());
    }
}
