//! Observer registry and broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::metrics::PROGRESS_OBSERVERS_DROPPED;

use super::types::{ItemOutcome, ProgressEvent, ProgressSnapshot};

/// Default capacity of each observer's queue.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 10;

struct Inner {
    observers: RwLock<HashMap<String, mpsc::Sender<ProgressEvent>>>,
    capacity: usize,
    total: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// Pub/sub fan-out of per-item outcomes.
///
/// Cloning is cheap and every clone shares the same registry and counters.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Inner>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_CAPACITY)
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("capacity", &self.inner.capacity)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ProgressTracker {
    /// Create a tracker whose observers each get a queue of `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                observers: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                total: AtomicUsize::new(0),
                succeeded: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            }),
        }
    }

    /// Register an observer and return its event queue.
    ///
    /// Subscribing again with the same id replaces the earlier registration;
    /// the earlier receiver sees its queue close.
    pub async fn subscribe(&self, observer_id: impl Into<String>) -> mpsc::Receiver<ProgressEvent> {
        let observer_id = observer_id.into();
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        let replaced = self
            .inner
            .observers
            .write()
            .await
            .insert(observer_id.clone(), tx);

        if replaced.is_some() {
            debug!(observer = %observer_id, "Replaced existing progress observer");
        } else {
            debug!(observer = %observer_id, "Progress observer subscribed");
        }
        rx
    }

    /// Remove an observer, closing its queue. No-op if it is not registered.
    pub async fn unsubscribe(&self, observer_id: &str) {
        if self.inner.observers.write().await.remove(observer_id).is_some() {
            debug!(observer = %observer_id, "Progress observer unsubscribed");
        }
    }

    /// Whether an observer is currently registered.
    pub async fn is_subscribed(&self, observer_id: &str) -> bool {
        self.inner.observers.read().await.contains_key(observer_id)
    }

    pub async fn observer_count(&self) -> usize {
        self.inner.observers.read().await.len()
    }

    /// Start counting a new run of `total` items.
    pub fn reset(&self, total: usize) {
        self.inner.total.store(total, Ordering::Relaxed);
        self.inner.succeeded.store(0, Ordering::Relaxed);
        self.inner.failed.store(0, Ordering::Relaxed);
    }

    /// Record one finished item and broadcast it.
    ///
    /// Never waits on an observer: one whose queue is full or closed is
    /// removed after the broadcast.
    pub async fn update_progress(&self, outcome: ItemOutcome, success: bool) {
        if success {
            self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
        }

        let event = ProgressEvent {
            batch_id: outcome.batch_id,
            name: outcome.name,
            path: outcome.path,
            success,
            converted_path: outcome.converted_path,
            error: outcome.error,
            progress: self.snapshot(),
        };

        let failed = self.broadcast(&event).await;
        if !failed.is_empty() {
            self.drop_failed(failed).await;
        }
    }

    /// Offer `event` to every observer; returns the ones that did not take it.
    async fn broadcast(&self, event: &ProgressEvent) -> Vec<(String, mpsc::Sender<ProgressEvent>)> {
        let observers = self.inner.observers.read().await;
        observers
            .iter()
            .filter(|(_, tx)| tx.try_send(event.clone()).is_err())
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect()
    }

    /// Remove registrations that missed an event. A registration replaced by
    /// a re-subscribe since then is a different channel and stays.
    async fn drop_failed(&self, failed: Vec<(String, mpsc::Sender<ProgressEvent>)>) {
        let mut observers = self.inner.observers.write().await;
        for (id, failed_tx) in failed {
            let same = observers
                .get(&id)
                .is_some_and(|tx| tx.same_channel(&failed_tx));
            if same {
                observers.remove(&id);
                PROGRESS_OBSERVERS_DROPPED.inc();
                info!(observer = %id, "Dropped unresponsive progress observer");
            }
        }
    }

    /// Current counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.inner.total.load(Ordering::Relaxed),
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(n: usize) -> ItemOutcome {
        ItemOutcome {
            batch_id: 1,
            name: format!("{n}.jpg"),
            path: format!("posts/{n}.jpg"),
            converted_path: Some(format!("posts/{n}.webp")),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let tracker = ProgressTracker::new(10);
        tracker.reset(2);
        let mut rx = tracker.subscribe("ui").await;

        tracker.update_progress(outcome(1), true).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "1.jpg");
        assert!(event.success);
        assert_eq!(event.progress.succeeded, 1);
        assert_eq!(event.progress.total, 2);
    }

    #[tokio::test]
    async fn test_five_updates_then_unsubscribe_closes_queue() {
        let tracker = ProgressTracker::new(10);
        let mut rx = tracker.subscribe("ui").await;

        for n in 0..5 {
            tracker.update_progress(outcome(n), n % 2 == 0).await;
        }
        tracker.unsubscribe("ui").await;

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 5);
        assert!(!tracker.is_subscribed("ui").await);
        assert_eq!(tracker.observer_count().await, 0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.succeeded, 3);
        assert_eq!(snapshot.failed, 2);
    }

    #[tokio::test]
    async fn test_slow_observer_is_dropped() {
        let tracker = ProgressTracker::new(3);
        let _slow = tracker.subscribe("slow").await;
        let mut fast = tracker.subscribe("fast").await;

        for n in 0..4 {
            tracker.update_progress(outcome(n), true).await;
            assert!(fast.recv().await.is_some());
        }

        assert!(!tracker.is_subscribed("slow").await);
        assert!(tracker.is_subscribed("fast").await);
    }

    #[tokio::test]
    async fn test_closed_observer_is_dropped() {
        let tracker = ProgressTracker::new(3);
        let rx = tracker.subscribe("gone").await;
        drop(rx);

        tracker.update_progress(outcome(0), false).await;

        assert_eq!(tracker.observer_count().await, 0);
        assert_eq!(tracker.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous_queue() {
        let tracker = ProgressTracker::new(3);
        let mut first = tracker.subscribe("ui").await;
        let mut second = tracker.subscribe("ui").await;

        tracker.update_progress(outcome(0), true).await;

        assert!(first.recv().await.is_none());
        assert!(second.recv().await.is_some());
        assert_eq!(tracker.observer_count().await, 1);
    }

    fn event(tracker: &ProgressTracker, n: usize) -> ProgressEvent {
        let outcome = outcome(n);
        ProgressEvent {
            batch_id: outcome.batch_id,
            name: outcome.name,
            path: outcome.path,
            success: true,
            converted_path: outcome.converted_path,
            error: outcome.error,
            progress: tracker.snapshot(),
        }
    }

    #[tokio::test]
    async fn test_observer_that_missed_an_event_is_dropped_even_after_draining() {
        let tracker = ProgressTracker::new(1);
        let mut rx = tracker.subscribe("ui").await;
        tracker.update_progress(outcome(0), true).await;

        let failed = tracker.broadcast(&event(&tracker, 1)).await;
        assert_eq!(failed.len(), 1);

        // Room again before removal; the missed event still counts.
        assert!(rx.recv().await.is_some());
        tracker.drop_failed(failed).await;

        assert!(!tracker.is_subscribed("ui").await);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_resubscribe_after_missed_event_survives_removal() {
        let tracker = ProgressTracker::new(1);
        let _stale = tracker.subscribe("ui").await;
        tracker.update_progress(outcome(0), true).await;

        let failed = tracker.broadcast(&event(&tracker, 1)).await;
        let mut fresh = tracker.subscribe("ui").await;
        tracker.drop_failed(failed).await;

        assert!(tracker.is_subscribed("ui").await);
        tracker.update_progress(outcome(2), true).await;
        assert_eq!(fresh.recv().await.unwrap().name, "2.jpg");
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let tracker = ProgressTracker::default();
        tracker.unsubscribe("nobody").await;
        assert_eq!(tracker.observer_count().await, 0);
    }

    #[test]
    fn test_reset_clears_counters() {
        let tracker = ProgressTracker::default();
        tracker.inner.succeeded.store(4, Ordering::Relaxed);
        tracker.reset(7);

        assert_eq!(
            tracker.snapshot(),
            ProgressSnapshot {
                total: 7,
                succeeded: 0,
                failed: 0
            }
        );
    }
}
