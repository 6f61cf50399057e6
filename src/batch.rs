//! Size-or-time batcher for revisions moving through a replication.
//!
//! Items are queued one at a time and handed to a processor in batches:
//! as soon as `capacity` items are waiting, or once the queue has been
//! quiet for `delay` after the last enqueue, whichever comes first.
//!
//! # Design
//!
//! ```text
//! queue(item) ──▶ Vec<T> ──┬── len >= capacity ──▶ flush now
//!                          │
//!                          └── otherwise ──▶ (re)arm timer ──▶ flush after delay
//!
//! flush: take ≤ capacity items ──▶ processor(batch).await ──▶ in_flight -= n
//! ```
//!
//! Flushes run one at a time so batches reach the processor in queue
//! order. [`Batcher::count`] includes items handed to the processor until
//! it returns; a replication is only idle once that count reaches zero.
//! Every change of the count is published on a `watch` channel.

use crate::metrics;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Receives each batch. The batch counts as pending until the future resolves.
pub type BatchHandler<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

struct State<T> {
    queue: Vec<T>,
    in_flight: usize,
    timer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    name: String,
    capacity: usize,
    delay: Duration,
    handler: BatchHandler<T>,
    state: Mutex<State<T>>,
    processing: tokio::sync::Mutex<()>,
    count_tx: watch::Sender<usize>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State<T>) {
        let count = state.queue.len() + state.in_flight;
        self.count_tx.send_replace(count);
    }
}

/// Accumulates items and flushes them to a handler in batches.
pub struct Batcher<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Batcher<T> {
    /// `name` labels logs and metrics (usually the replication session ID).
    pub fn new(name: impl Into<String>, capacity: usize, delay: Duration, handler: BatchHandler<T>) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                capacity: capacity.max(1),
                delay,
                handler,
                state: Mutex::new(State {
                    queue: Vec::new(),
                    in_flight: 0,
                    timer: None,
                }),
                processing: tokio::sync::Mutex::new(()),
                count_tx,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Queue one item.
    pub fn queue(&self, item: T) {
        self.queue_all(std::iter::once(item));
    }

    /// Queue several items, arming at most one flush.
    pub fn queue_all(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.inner.lock();
        let before = state.queue.len();
        state.queue.extend(items);
        if state.queue.len() == before {
            return;
        }
        trace!(batcher = %self.inner.name, queued = state.queue.len(), "Queued");

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.queue.len() >= self.inner.capacity || self.inner.delay.is_zero() {
            tokio::spawn(Self::flush_task(Arc::clone(&self.inner)));
        } else {
            state.timer = Some(Self::arm_timer(&self.inner));
        }
        self.inner.publish(&state);
    }

    fn arm_timer(inner: &Arc<Inner<T>>) -> JoinHandle<()> {
        let inner_clone = Arc::clone(inner);
        let delay = inner.delay;
        // The flush runs in its own task so aborting a fired timer never
        // cancels a batch mid-handler.
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(Self::flush_task(inner_clone));
        })
    }

    /// Process everything queued right now and wait for it.
    pub async fn flush_all(&self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
        }
        loop {
            if !Self::flush_once(&self.inner).await {
                break;
            }
        }
    }

    /// Drop everything queued and cancel the pending flush.
    ///
    /// Batches already handed to the handler still finish.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
            debug!(batcher = %self.inner.name, dropped, "Cleared batcher");
        }
        self.inner.publish(&state);
    }

    /// Items queued plus items the handler is still working on.
    pub fn count(&self) -> usize {
        let state = self.inner.lock();
        state.queue.len() + state.in_flight
    }

    /// Observe [`count`](Self::count) as it changes.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.inner.count_tx.subscribe()
    }

    async fn flush_task(inner: Arc<Inner<T>>) {
        loop {
            if !Self::flush_once(&inner).await {
                return;
            }
            let mut state = inner.lock();
            if state.queue.len() >= inner.capacity {
                continue;
            }
            // Leftovers below capacity wait for the quiet period.
            let timer_live = state.timer.as_ref().is_some_and(|t| !t.is_finished());
            if !state.queue.is_empty() && !timer_live {
                state.timer = Some(Self::arm_timer(&inner));
            }
            return;
        }
    }

    /// Hand up to one batch to the handler. Returns false if nothing was queued.
    async fn flush_once(inner: &Arc<Inner<T>>) -> bool {
        let _processing = inner.processing.lock().await;
        let batch: Vec<T> = {
            let mut state = inner.lock();
            let n = state.queue.len().min(inner.capacity);
            if n == 0 {
                return false;
            }
            let batch: Vec<T> = state.queue.drain(..n).collect();
            state.in_flight += n;
            batch
        };
        let size = batch.len();
        debug!(batcher = %inner.name, size, "Flushing batch");
        metrics::record_batch_flush(&inner.name, size);

        (inner.handler)(batch).await;

        let mut state = inner.lock();
        state.in_flight = state.in_flight.saturating_sub(size);
        inner.publish(&state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_handler(batches: Arc<Mutex<Vec<Vec<u32>>>>) -> BatchHandler<u32> {
        Arc::new(move |batch: Vec<u32>| {
            let batches = Arc::clone(&batches);
            Box::pin(async move {
                batches.lock().unwrap().push(batch);
            })
        })
    }

    #[tokio::test]
    async fn test_flushes_at_capacity() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let batcher = Batcher::new("t", 3, Duration::from_secs(60), recording_handler(batches.clone()));

        for i in 0..3 {
            batcher.queue(i);
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while batches.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(batches.lock().unwrap()[0], vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_flushes_after_quiet_period() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let batcher = Batcher::new("t", 200, Duration::from_millis(30), recording_handler(batches.clone()));

        batcher.queue(1);
        batcher.queue(2);
        assert_eq!(batcher.count(), 2);
        assert!(batches.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2]]);
        assert_eq!(batcher.count(), 0);
    }

    #[tokio::test]
    async fn test_count_includes_in_flight() {
        let release = Arc::new(tokio::sync::Notify::new());
        let processed = Arc::new(AtomicUsize::new(0));
        let handler: BatchHandler<u32> = {
            let release = release.clone();
            let processed = processed.clone();
            Arc::new(move |batch: Vec<u32>| {
                let release = release.clone();
                let processed = processed.clone();
                Box::pin(async move {
                    release.notified().await;
                    processed.fetch_add(batch.len(), Ordering::SeqCst);
                })
            })
        };
        let batcher = Batcher::new("t", 2, Duration::from_secs(60), handler);
        let mut counts = batcher.subscribe();

        batcher.queue(1);
        batcher.queue(2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Handed to the handler but not finished.
        assert_eq!(batcher.count(), 2);

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(2), counts.wait_for(|c| *c == 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_drops_queued() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let batcher = Batcher::new("t", 200, Duration::from_millis(20), recording_handler(batches.clone()));
        batcher.queue_all([1, 2, 3]);
        batcher.clear();
        assert_eq!(batcher.count(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_all_splits_by_capacity() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let batcher = Batcher::new("t", 200, Duration::from_secs(60), recording_handler(batches.clone()));
        batcher.queue_all(0..450);
        // queue_all arms a single flush; flush_all drains in order.
        batcher.flush_all().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sizes: Vec<usize> = batches.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 450);
        assert!(sizes.iter().all(|s| *s <= 200));
        let flat: Vec<u32> = batches.lock().unwrap().iter().flatten().copied().collect();
        assert_eq!(flat, (0..450).collect::<Vec<_>>());
    }
}
