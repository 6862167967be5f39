//! Bounded outbound queue with drop-oldest backpressure (spec.md §4.5/§4.6:
//! "blocking writes on a full outbound channel drop the oldest audio frame
//! and record a metric, never block the reader").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

use super::types::OutboundMsg;

pub struct OutboundQueue {
    inner: Mutex<VecDeque<OutboundMsg>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks; drops the oldest queued message when at capacity.
    pub fn push(&self, msg: OutboundMsg) {
        let mut q = self.inner.lock().expect("outbound queue mutex poisoned");
        if q.len() >= self.capacity {
            q.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped_total = total, "outbound provider queue full, dropped oldest frame");
        }
        q.push_back(msg);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> OutboundMsg {
        loop {
            {
                let mut q = self.inner.lock().expect("outbound queue mutex poisoned");
                if let Some(m) = q.pop_front() {
                    return m;
                }
            }
            self.notify.notified().await;
        }
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_when_full() {
        let q = OutboundQueue::new(2);
        q.push(OutboundMsg::Audio("a".into()));
        q.push(OutboundMsg::Audio("b".into()));
        q.push(OutboundMsg::Audio("c".into()));

        assert_eq!(q.dropped_count(), 1);
        let first = q.pop().await;
        assert!(matches!(first, OutboundMsg::Audio(s) if s == "b"));
        let second = q.pop().await;
        assert!(matches!(second, OutboundMsg::Audio(s) if s == "c"));
    }
}
