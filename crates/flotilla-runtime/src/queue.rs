//! Work queue with per-key exclusivity.
//!
//! A key is in at most one of `pending` (sent to the dispatcher, not yet
//! started) or `running`. Triggers for a pending key are absorbed; triggers
//! for a running key mark it dirty so it runs once more after finishing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

#[derive(Default)]
struct QueueState {
    pending: HashSet<String>,
    running: HashSet<String>,
    dirty: HashSet<String>,
    /// Consecutive failures per key, for backoff.
    failures: HashMap<String, u32>,
}

/// Cheap handle for feeding keys into a controller's queue.
#[derive(Clone)]
pub struct QueueHandle {
    name: &'static str,
    state: Arc<Mutex<QueueState>>,
    tx: mpsc::UnboundedSender<String>,
}

impl QueueHandle {
    pub(crate) fn new(name: &'static str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            name,
            state: Arc::new(Mutex::new(QueueState::default())),
            tx,
        };
        (handle, rx)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `key` for reconciliation as soon as a worker is free.
    pub fn enqueue(&self, key: &str) {
        let mut state = self.lock();
        if state.running.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.pending.insert(key.to_string()) {
            trace!(controller = self.name, %key, "enqueued");
            if self.tx.send(key.to_string()).is_err() {
                // Dispatcher is gone; nothing will drain this entry.
                state.pending.remove(key);
            }
        }
    }

    /// Schedule `key` after `delay`. Must be called inside a tokio runtime.
    pub fn enqueue_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let handle = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.enqueue(&key);
        });
    }

    /// Number of keys pending or running.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a dispatched key from pending to running.
    pub(crate) fn start(&self, key: &str) {
        let mut state = self.lock();
        state.pending.remove(key);
        state.running.insert(key.to_string());
    }

    /// Mark `key` finished. Returns the consecutive failure count after this
    /// attempt and whether the key was triggered again while running, in
    /// which case it has already been put back on the queue.
    pub(crate) fn finish(&self, key: &str, failed: bool) -> (u32, bool) {
        let mut state = self.lock();
        state.running.remove(key);
        let failures = if failed {
            let n = state.failures.entry(key.to_string()).or_insert(0);
            *n += 1;
            *n
        } else {
            state.failures.remove(key);
            0
        };
        let rerun = state.dirty.remove(key);
        if rerun && state.pending.insert(key.to_string()) && self.tx.send(key.to_string()).is_err() {
            state.pending.remove(key);
        }
        (failures, rerun)
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }
}
