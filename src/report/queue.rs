//! Bounded hand-off between the reconciler and the reporter.
//!
//! When full, the oldest queued non-critical verdict is evicted to make
//! room. Critical verdicts are never evicted; if the queue is entirely
//! critical the producer waits, which pauses event ingestion rather than
//! losing an alert.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};

use crate::monitor::model::{Severity, Verdict};

pub struct VerdictQueue {
    inner: Mutex<VecDeque<Verdict>>,
    capacity: usize,
    ready: Notify,
    space: Notify,
    closed: AtomicBool,
}

impl VerdictQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            ready: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn push(&self, verdict: Verdict) {
        loop {
            {
                let mut queue = self.inner.lock().await;
                if queue.len() < self.capacity {
                    queue.push_back(verdict);
                    self.ready.notify_one();
                    return;
                }
                if let Some(pos) = queue
                    .iter()
                    .position(|queued| queued.severity != Severity::Critical)
                {
                    if let Some(dropped) = queue.remove(pos) {
                        log::warn!(
                            "Verdict queue full, dropping oldest {} verdict for {}",
                            dropped.severity.as_ref(),
                            dropped.container_id
                        );
                    }
                    queue.push_back(verdict);
                    self.ready.notify_one();
                    return;
                }
            }
            log::warn!("Verdict queue full of critical verdicts, pausing ingestion");
            self.space.notified().await;
        }
    }

    /// Wait for the next verdict. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<Verdict> {
        loop {
            let ready = self.ready.notified();
            {
                let mut queue = self.inner.lock().await;
                if let Some(verdict) = queue.pop_front() {
                    self.space.notify_one();
                    return Some(verdict);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Non-blocking pop, used while flushing on shutdown.
    pub async fn try_pop(&self) -> Option<Verdict> {
        let mut queue = self.inner.lock().await;
        let verdict = queue.pop_front();
        if verdict.is_some() {
            self.space.notify_one();
        }
        verdict
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a consumer that checked the queue
        // but has not parked on its wakeup future yet still sees the close.
        self.ready.notify_one();
        self.ready.notify_waiters();
    }
}
