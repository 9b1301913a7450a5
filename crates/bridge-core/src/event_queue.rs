//! Bounded FIFO of `BridgeEvent`s a tool caller drains with `poll`. Oldest
//! events are dropped once the queue is full; pollers are told how many were
//! lost so "I was too slow" is visible rather than silent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bridge_types::BridgeEvent;
use tokio::sync::Notify;

const MAX_POLL_WAIT_MS: u64 = 30_000;

pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    events: VecDeque<BridgeEvent>,
    cap: usize,
    dropped: u64,
}

/// Result of a `poll`: the events themselves plus how many were evicted
/// before this poll had a chance to see them.
pub struct Drained {
    pub events: Vec<BridgeEvent>,
    pub dropped_since_last_poll: u64,
}

impl EventQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(cap.min(1024)),
                cap: cap.max(1),
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, event: BridgeEvent) {
        let mut inner = self.inner.lock().unwrap();
        if inner.events.len() >= inner.cap {
            inner.events.pop_front();
            inner.dropped += 1;
        }
        inner.events.push_back(event);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn drain_locked(inner: &mut Inner, max_events: usize) -> Drained {
        let max_events = max_events.max(1);
        let mut events = Vec::with_capacity(max_events.min(inner.events.len()));
        while events.len() < max_events {
            match inner.events.pop_front() {
                Some(e) => events.push(e),
                None => break,
            }
        }
        let dropped = std::mem::take(&mut inner.dropped);
        Drained {
            events,
            dropped_since_last_poll: dropped,
        }
    }

    /// Returns immediately if anything is queued; otherwise waits up to
    /// `wait_ms` (capped at 30s) for the next push before returning empty.
    pub async fn poll(&self, max_events: usize, wait_ms: u64) -> Drained {
        let wait_ms = wait_ms.min(MAX_POLL_WAIT_MS);
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.events.is_empty() {
                    return Self::drain_locked(&mut inner, max_events);
                }
            }
            if wait_ms == 0 {
                return Drained {
                    events: Vec::new(),
                    dropped_since_last_poll: 0,
                };
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {
                    let mut inner = self.inner.lock().unwrap();
                    return Self::drain_locked(&mut inner, max_events);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_types::BridgeEvent;

    fn ev() -> BridgeEvent {
        BridgeEvent::Ready { ts: 0 }
    }

    #[tokio::test]
    async fn drops_oldest_past_capacity() {
        let q = EventQueue::new(2);
        q.push(ev());
        q.push(ev());
        q.push(ev());
        let d = q.poll(10, 0).await;
        assert_eq!(d.events.len(), 2);
        assert_eq!(d.dropped_since_last_poll, 1);
    }

    #[tokio::test]
    async fn poll_returns_immediately_when_nonempty() {
        let q = EventQueue::new(8);
        q.push(ev());
        let start = std::time::Instant::now();
        let d = q.poll(10, 5_000).await;
        assert_eq!(d.events.len(), 1);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn poll_wakes_on_push() {
        let q = std::sync::Arc::new(EventQueue::new(8));
        let q2 = q.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            q2.push(ev());
        });
        let d = q.poll(10, 2_000).await;
        assert_eq!(d.events.len(), 1);
        handle.await.unwrap();
    }
}
