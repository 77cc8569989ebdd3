//! Async work queue
//!
//! Keys are deduplicated while queued and never reconciled concurrently. A
//! key added while its reconcile is running is queued again once that run
//! finishes. Failed reconciles come back after a fixed delay.

use crate::error::{ErrorAction, Result, DEFAULT_REQUEUE_DELAY};
use crate::metrics::metrics;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Reconciler
// =============================================================================

/// Outcome of a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing left to do until the key is added again
    Done,
    /// Not ready yet; look again after the delay
    RequeueAfter(Duration),
}

/// Per-key reconcile logic driven by an [`AsyncWorker`]
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used in logs and metrics
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &str) -> Result<Action>;
}

// =============================================================================
// Worker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Queued,
    Processing,
    /// Re-added while processing
    ProcessingDirty,
}

/// Deduplicating work queue with a pool of reconcile tasks
pub struct AsyncWorker {
    requeue_delay: Duration,
    states: DashMap<String, KeyState>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl std::fmt::Debug for AsyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWorker")
            .field("requeue_delay", &self.requeue_delay)
            .field("keys", &self.states.len())
            .finish()
    }
}

impl Default for AsyncWorker {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEUE_DELAY)
    }
}

impl AsyncWorker {
    /// Create a queue whose failed keys are retried after `requeue_delay`
    pub fn new(requeue_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            requeue_delay,
            states: DashMap::new(),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue a key unless it is already waiting
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        match self.states.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == KeyState::Processing {
                    entry.insert(KeyState::ProcessingDirty);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(KeyState::Queued);
                if self.tx.send(key).is_err() {
                    warn!("Work queue closed, dropping key");
                }
            }
        }
    }

    /// Enqueue a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            worker.add(key);
        });
    }

    /// Keys queued or in flight
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Run `workers` reconcile tasks until `cancel` fires
    pub async fn run<R: Reconciler>(
        self: Arc<Self>,
        workers: usize,
        reconciler: Arc<R>,
        cancel: CancellationToken,
    ) {
        let tasks: Vec<_> = (0..workers.max(1))
            .map(|_| {
                let worker = Arc::clone(&self);
                let reconciler = Arc::clone(&reconciler);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let key = tokio::select! {
                            _ = cancel.cancelled() => return,
                            key = worker.next() => match key {
                                Some(key) => key,
                                None => return,
                            },
                        };
                        worker.process(&key, reconciler.as_ref()).await;
                    }
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(controller = reconciler.name(), error = %e, "Worker task aborted");
            }
        }
        debug!(controller = reconciler.name(), "Workers stopped");
    }

    async fn next(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    async fn process<R: Reconciler>(self: &Arc<Self>, key: &str, reconciler: &R) {
        if let Some(mut state) = self.states.get_mut(key) {
            *state = KeyState::Processing;
        }

        let controller = reconciler.name();
        metrics().reconciles.with_label_values(&[controller]).inc();

        let requeue = match reconciler.reconcile(key).await {
            Ok(Action::Done) => None,
            Ok(Action::RequeueAfter(delay)) => Some(delay),
            Err(e) => {
                metrics().reconcile_errors.with_label_values(&[controller]).inc();
                warn!(controller, key, error = %e, "Reconcile failed");
                match e.action() {
                    ErrorAction::RequeueAfter(_) => Some(self.requeue_delay),
                    ErrorAction::NoRequeue => None,
                }
            }
        };

        let dirty = matches!(
            self.states.remove(key),
            Some((_, KeyState::ProcessingDirty))
        );
        if dirty {
            self.add(key);
        }
        if let Some(delay) = requeue {
            self.add_after(key, delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        seen: SyncMutex<Vec<String>>,
        failures_left: AtomicUsize,
        worker: SyncMutex<Option<Arc<AsyncWorker>>>,
        readd_once: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Recorder {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn reconcile(&self, key: &str) -> Result<Action> {
            self.seen.lock().push(key.to_string());
            if self
                .readd_once
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                if let Some(worker) = self.worker.lock().as_ref() {
                    worker.add(key);
                }
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Internal("boom".into()));
            }
            Ok(Action::Done)
        }
    }

    async fn drive(worker: &Arc<AsyncWorker>, recorder: &Arc<Recorder>, wait: Duration) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(worker).run(2, Arc::clone(recorder), cancel.clone()));
        tokio::time::sleep(wait).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_keys_are_deduplicated() {
        let worker = Arc::new(AsyncWorker::new(Duration::from_millis(10)));
        worker.add("a");
        worker.add("a");
        worker.add("b");
        assert_eq!(worker.len(), 2);

        let recorder = Arc::new(Recorder::default());
        drive(&worker, &recorder, Duration::from_millis(100)).await;

        let mut seen = recorder.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
        assert!(worker.is_empty());
    }

    #[tokio::test]
    async fn test_failed_key_is_retried() {
        let worker = Arc::new(AsyncWorker::new(Duration::from_millis(10)));
        worker.add("a");

        let recorder = Arc::new(Recorder::default());
        recorder.failures_left.store(2, Ordering::SeqCst);
        drive(&worker, &recorder, Duration::from_millis(200)).await;

        assert_eq!(recorder.seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_key_added_while_processing_runs_again() {
        let worker = Arc::new(AsyncWorker::new(Duration::from_millis(10)));
        let recorder = Arc::new(Recorder::default());
        *recorder.worker.lock() = Some(Arc::clone(&worker));
        recorder.readd_once.store(1, Ordering::SeqCst);

        worker.add("a");
        drive(&worker, &recorder, Duration::from_millis(100)).await;

        assert_eq!(*recorder.seen.lock(), vec!["a".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_next_waits_for_keys() {
        let worker = AsyncWorker::default();
        let mut next = tokio_test::task::spawn(worker.next());
        tokio_test::assert_pending!(next.poll());

        worker.add("a");
        assert!(next.is_woken());
        assert_eq!(tokio_test::assert_ready!(next.poll()), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_add_after_delays_key() {
        let worker = Arc::new(AsyncWorker::default());
        worker.add_after("late", Duration::from_millis(20));
        assert!(worker.is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(worker.len(), 1);
    }
}
