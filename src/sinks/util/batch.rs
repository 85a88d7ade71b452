use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use logtap_buffers::BatchLimits;
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Why a batch left the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The periodic timer fired with a non-empty batch.
    Timer,
    /// Adding the next item would have pushed a dimension past its limit,
    /// so the batch was flushed first.
    BeforeAdd,
    /// The add filled a dimension to its limit.
    AfterAdd,
    /// The collector is shutting down.
    Stop,
}

/// A flushed batch: the items in arrival order plus the per-dimension
/// counts accumulated for them.
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub counts: Vec<u64>,
    pub reason: FlushReason,
}

struct State<T> {
    items: Vec<T>,
    limits: BatchLimits<T>,
}

/// Accumulates items into batches bounded by time and by N count
/// dimensions, handing each batch to `on_batch`.
///
/// Adds, timer fires, and stop are serialized by one mutex. The timer is
/// opportunistic: when an add holds the lock at fire time the tick is
/// skipped rather than queued, since that add will flush on its own if
/// the batch is full.
pub struct BatchCollector<T> {
    state: Arc<Mutex<State<T>>>,
    on_batch: Arc<dyn Fn(Batch<T>) + Send + Sync>,
    timer_cancel: CancellationToken,
}

impl<T: Send + 'static> BatchCollector<T> {
    /// Build a collector and start its flush timer. The first fire lands
    /// at a random point within `interval` so that many collectors
    /// created together do not flush in phase. Must be called from within
    /// a tokio runtime.
    pub fn new(
        interval: Duration,
        limits: BatchLimits<T>,
        on_batch: impl Fn(Batch<T>) + Send + Sync + 'static,
    ) -> Self {
        let state = Arc::new(Mutex::new(State {
            items: Vec::new(),
            limits,
        }));
        let on_batch: Arc<dyn Fn(Batch<T>) + Send + Sync> = Arc::new(on_batch);
        let timer_cancel = CancellationToken::new();

        let collector = Self {
            state,
            on_batch,
            timer_cancel,
        };
        collector.spawn_timer(interval);
        collector
    }

    fn spawn_timer(&self, interval: Duration) {
        let state = Arc::downgrade(&self.state);
        let on_batch = Arc::clone(&self.on_batch);
        let cancel = self.timer_cancel.clone();
        let first_fire = {
            let interval_ms = interval.as_millis().max(1) as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..interval_ms))
        };

        tokio::spawn(async move {
            let mut delay = first_fire;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return,
                }
                delay = interval;

                let Some(state) = state.upgrade() else {
                    return;
                };
                // Contended means another path is already flushing or
                // adding; drop this tick.
                if let Ok(mut guard) = state.try_lock() {
                    if !guard.items.is_empty() {
                        flush(&mut guard, &on_batch, FlushReason::Timer);
                    }
                };
            }
        });
    }

    /// Add one item, flushing around it as the limits require.
    pub fn add(&self, item: T) {
        let mut state = self.state.lock().expect("Data poisoned.");

        if !state.items.is_empty() && state.limits.would_overflow(&item) {
            flush(&mut state, &self.on_batch, FlushReason::BeforeAdd);
        }

        state.limits.add(&item);
        state.items.push(item);

        if state.limits.at_capacity() {
            flush(&mut state, &self.on_batch, FlushReason::AfterAdd);
        }
    }

    /// Stop the timer and flush what is buffered. Gives up after one
    /// second if another path wedges the lock.
    pub async fn stop(&self) {
        self.timer_cancel.cancel();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if let Ok(mut state) = self.state.try_lock() {
                if !state.items.is_empty() {
                    flush(&mut state, &self.on_batch, FlushReason::Stop);
                }
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(message = "Could not acquire batch lock within stop deadline; skipping final flush.");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl<T> Drop for BatchCollector<T> {
    fn drop(&mut self) {
        self.timer_cancel.cancel();
    }
}

fn flush<T>(
    state: &mut MutexGuard<'_, State<T>>,
    on_batch: &Arc<dyn Fn(Batch<T>) + Send + Sync>,
    reason: FlushReason,
) {
    let items = std::mem::take(&mut state.items);
    let counts = state.limits.counts().to_vec();
    state.limits.reset();
    on_batch(Batch {
        items,
        counts,
        reason,
    });
}
