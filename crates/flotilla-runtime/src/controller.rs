//! Controller: drives a [`Reconciler`] from a work queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::queue::QueueHandle;

/// What the scheduler should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing pending; wait for the next change event.
    AwaitChange,
    /// Look again after the given delay, or sooner if something changes.
    Requeue(Duration),
}

impl Action {
    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue(after: Duration) -> Self {
        Action::Requeue(after)
    }
}

/// Idempotent reconcile function for one kind of key.
///
/// Implementations are called from blocking worker threads and must be
/// safe to run concurrently for distinct keys.
pub trait Reconciler: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Used in logs.
    const NAME: &'static str;

    fn reconcile(&self, key: &str) -> Result<Action, Self::Error>;

    /// Whether a failed pass should be retried with backoff. Errors that
    /// signal a caller bug return false and are only logged.
    fn is_retryable(&self, _error: &Self::Error) -> bool {
        true
    }
}

/// Worker and backoff settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    /// Delay before retry number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Runs one reconciler over a work queue.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    config: ControllerConfig,
    queue: QueueHandle,
    rx: mpsc::UnboundedReceiver<String>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: R, config: ControllerConfig) -> Self {
        let (queue, rx) = QueueHandle::new(R::NAME);
        Self {
            reconciler: Arc::new(reconciler),
            config,
            queue,
            rx,
        }
    }

    /// Handle for enqueueing keys; clone freely.
    pub fn queue(&self) -> QueueHandle {
        self.queue.clone()
    }

    /// Dispatch keys until `shutdown` flips. In-flight passes are allowed
    /// to finish; queued keys are dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let workers = self.config.workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        info!(controller = R::NAME, workers, "controller started");

        loop {
            tokio::select! {
                key = self.rx.recv() => {
                    let Some(key) = key else { break };
                    let permit = tokio::select! {
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(p) => p,
                            Err(_) => break,
                        },
                        _ = shutdown.changed() => break,
                    };
                    self.queue.start(&key);
                    let reconciler = self.reconciler.clone();
                    let queue = self.queue.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        process(reconciler, queue, config, key).await;
                        drop(permit);
                    });
                }
                _ = shutdown.changed() => break,
            }
        }

        // Wait for in-flight passes.
        let _ = permits.acquire_many(workers as u32).await;
        info!(controller = R::NAME, "controller stopped");
    }
}

async fn process<R: Reconciler>(
    reconciler: Arc<R>,
    queue: QueueHandle,
    config: ControllerConfig,
    key: String,
) {
    let task_key = key.clone();
    let task_reconciler = reconciler.clone();
    let result = tokio::task::spawn_blocking(move || task_reconciler.reconcile(&task_key)).await;

    let next = match result {
        Ok(Ok(action)) => {
            let (_, rerun) = queue.finish(&key, false);
            debug!(controller = queue.name(), %key, ?action, "reconciled");
            match action {
                Action::Requeue(after) if !rerun => Some(after),
                _ => None,
            }
        }
        Ok(Err(e)) if !reconciler.is_retryable(&e) => {
            queue.finish(&key, false);
            error!(controller = queue.name(), %key, error = %e, "reconcile failed, not retrying");
            None
        }
        Ok(Err(e)) => {
            let (failures, rerun) = queue.finish(&key, true);
            let delay = config.backoff(failures);
            warn!(
                controller = queue.name(),
                %key,
                error = %e,
                failures,
                retry_in_ms = delay.as_millis() as u64,
                "reconcile failed"
            );
            (!rerun).then_some(delay)
        }
        Err(join) => {
            let (failures, rerun) = queue.finish(&key, true);
            error!(controller = queue.name(), %key, error = %join, "reconcile panicked");
            (!rerun).then_some(config.backoff(failures))
        }
    };

    if let Some(delay) = next {
        queue.enqueue_after(&key, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        /// Keys that fail transiently this many times before succeeding.
        fail_first: Mutex<HashMap<String, usize>>,
        hold: Duration,
    }

    impl Recorder {
        fn calls(&self, key: &str) -> usize {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    impl Reconciler for Arc<Recorder> {
        type Error = TestError;
        const NAME: &'static str = "recorder";

        fn reconcile(&self, key: &str) -> Result<Action, TestError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.hold);
            *self.calls.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if key == "fatal" {
                return Err(TestError::Fatal);
            }
            let mut fail = self.fail_first.lock().unwrap();
            if let Some(n) = fail.get_mut(key)
                && *n > 0
            {
                *n -= 1;
                return Err(TestError::Transient);
            }
            Ok(Action::await_change())
        }

        fn is_retryable(&self, error: &TestError) -> bool {
            matches!(error, TestError::Transient)
        }
    }

    fn fast_config(workers: usize) -> ControllerConfig {
        ControllerConfig {
            workers,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    async fn settle(queue: &QueueHandle) {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if queue.is_empty() {
                return;
            }
        }
        panic!("queue did not drain");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ControllerConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(10), Duration::from_secs(60));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_key_never_runs_concurrently() {
        let recorder = Arc::new(Recorder {
            hold: Duration::from_millis(80),
            ..Default::default()
        });
        let controller = Controller::new(recorder.clone(), fast_config(4));
        let queue = controller.queue();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));

        queue.enqueue("web");
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("web");
        queue.enqueue("web");
        settle(&queue).await;

        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        // One initial pass plus one for the triggers seen while running.
        assert_eq!(recorder.calls("web"), 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn distinct_keys_run_in_parallel() {
        let recorder = Arc::new(Recorder {
            hold: Duration::from_millis(50),
            ..Default::default()
        });
        let controller = Controller::new(recorder.clone(), fast_config(4));
        let queue = controller.queue();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));

        for key in ["a", "b", "c"] {
            queue.enqueue(key);
        }
        settle(&queue).await;

        assert!(recorder.max_in_flight.load(Ordering::SeqCst) > 1);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_errors_retry_with_backoff() {
        let recorder = Arc::new(Recorder::default());
        recorder
            .fail_first
            .lock()
            .unwrap()
            .insert("flaky".to_string(), 2);
        let controller = Controller::new(recorder.clone(), fast_config(2));
        let queue = controller.queue();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));

        queue.enqueue("flaky");
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if recorder.calls("flaky") >= 3 {
                break;
            }
        }
        assert_eq!(recorder.calls("flaky"), 3);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fatal_errors_are_not_retried() {
        let recorder = Arc::new(Recorder::default());
        let controller = Controller::new(recorder.clone(), fast_config(2));
        let queue = controller.queue();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));

        queue.enqueue("fatal");
        settle(&queue).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.calls("fatal"), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
