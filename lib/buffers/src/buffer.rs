use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::SimpleQueue;

/// What `add` does when the primary channel is at capacity.
///
/// `Block` gives the high/low watermark behavior: producers suspend until
/// the pump makes room. `Overflow` tries the secondary queue first and only
/// falls back to blocking when the secondary refuses the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenFull {
    Block,
    Overflow,
}

#[derive(Debug, Snafu)]
pub enum BufferError {
    #[snafu(display("buffer pump has shut down"))]
    Closed,

    #[snafu(display("a pump is already running for this buffer"))]
    PumpActive,
}

type SharedSecondary<T> = Arc<Mutex<Box<dyn SimpleQueue<T>>>>;

/// Builder for the primary/secondary buffer. The handle side is cloned
/// into producers; the pump side is consumed by the single task that
/// delivers items downstream.
pub struct Buffer;

impl Buffer {
    pub fn new<T: Send + 'static>(
        size_hint: usize,
        when_full: WhenFull,
        secondary: Option<Box<dyn SimpleQueue<T>>>,
    ) -> (BufferHandle<T>, BufferPump<T>) {
        let (tx, rx) = mpsc::channel(size_hint.max(1));
        let secondary = secondary.map(|queue| Arc::new(Mutex::new(queue)));
        let pump_active = Arc::new(AtomicBool::new(false));

        (
            BufferHandle {
                tx,
                when_full,
                secondary: secondary.clone(),
            },
            BufferPump {
                rx,
                secondary,
                active: pump_active,
            },
        )
    }
}

pub struct BufferHandle<T> {
    tx: mpsc::Sender<T>,
    when_full: WhenFull,
    secondary: Option<SharedSecondary<T>>,
}

impl<T> Clone for BufferHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            when_full: self.when_full,
            secondary: self.secondary.clone(),
        }
    }
}

impl<T: Send> BufferHandle<T> {
    /// Enqueue one item according to the configured full-buffer policy.
    pub async fn add(&self, item: T) -> Result<(), BufferError> {
        match self.when_full {
            WhenFull::Block => self.send_primary(item).await,
            WhenFull::Overflow => match self.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(BufferError::Closed),
                Err(mpsc::error::TrySendError::Full(item)) => {
                    match self.try_secondary(item) {
                        Ok(()) => Ok(()),
                        // Secondary missing or full: fall back to waiting on
                        // the primary like the blocking variant.
                        Err(item) => self.send_primary(item).await,
                    }
                }
            },
        }
    }

    /// Put an item back. High priority re-enters the primary channel;
    /// low priority goes to the secondary queue, best effort.
    pub async fn requeue(&self, item: T, high_priority: bool) -> Result<(), BufferError> {
        if high_priority {
            return self.send_primary(item).await;
        }
        match self.try_secondary(item) {
            Ok(()) => Ok(()),
            Err(item) => self.send_primary(item).await,
        }
    }

    async fn send_primary(&self, item: T) -> Result<(), BufferError> {
        self.tx.send(item).await.map_err(|_| BufferError::Closed)
    }

    fn try_secondary(&self, item: T) -> Result<(), T> {
        match &self.secondary {
            Some(secondary) => secondary.lock().expect("Data poisoned.").enqueue(item),
            None => Err(item),
        }
    }
}

pub struct BufferPump<T> {
    rx: mpsc::Receiver<T>,
    secondary: Option<SharedSecondary<T>>,
    active: Arc<AtomicBool>,
}

impl<T: Send + 'static> BufferPump<T> {
    /// Run the pump loop until cancelled, delivering each item to
    /// `on_next`.
    ///
    /// The primary channel is drained completely before the secondary is
    /// consulted, and only a single secondary item is delivered per pass so
    /// freshly arrived primary items preempt the low-priority backlog.
    ///
    /// Only one pump may run per buffer; a second call fails with
    /// `PumpActive`.
    pub async fn run<F, Fut>(
        mut self,
        mut on_next: F,
        cancel: CancellationToken,
    ) -> Result<(), BufferError>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BufferError::PumpActive);
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Drain everything currently queued in the primary.
            let mut delivered = false;
            while let Ok(item) = self.rx.try_recv() {
                on_next(item).await;
                delivered = true;
                if cancel.is_cancelled() {
                    break;
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            // One low-priority item, then back to the top so the primary
            // is re-checked before the next one.
            if let Some(item) = self.pop_secondary() {
                on_next(item).await;
                continue;
            }
            if delivered {
                continue;
            }

            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => on_next(item).await,
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }

        self.drain_to_secondary();
        self.active.store(false, Ordering::Release);
        Ok(())
    }

    fn pop_secondary(&mut self) -> Option<T> {
        self.secondary
            .as_ref()
            .and_then(|secondary| secondary.lock().expect("Data poisoned.").dequeue())
    }

    /// On shutdown, anything still sitting in the primary is spilled to
    /// the secondary queue when one exists.
    fn drain_to_secondary(&mut self) {
        let Some(secondary) = self.secondary.as_ref() else {
            return;
        };
        let mut secondary = secondary.lock().expect("Data poisoned.");
        while let Ok(item) = self.rx.try_recv() {
            if secondary.enqueue(item).is_err() {
                warn!(message = "Secondary queue full during shutdown drain; remaining items dropped.");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::VecQueue;

    fn collector() -> (
        Arc<StdMutex<Vec<u32>>>,
        impl FnMut(u32) -> std::future::Ready<()>,
    ) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_next = move |item| {
            sink.lock().unwrap().push(item);
            std::future::ready(())
        };
        (seen, on_next)
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (handle, pump) = Buffer::new(8, WhenFull::Block, None);
        let (seen, on_next) = collector();
        let cancel = CancellationToken::new();
        let pump_task = tokio::spawn(pump.run(on_next, cancel.clone()));

        for item in 0..5u32 {
            handle.add(item).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        pump_task.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn blocking_add_waits_for_capacity() {
        let (handle, pump) = Buffer::new(2, WhenFull::Block, None);

        handle.add(1).await.unwrap();
        handle.add(2).await.unwrap();
        // Channel is full; a third add must suspend until the pump drains.
        let pending = tokio::time::timeout(Duration::from_millis(50), handle.add(3)).await;
        assert!(pending.is_err());

        let (seen, on_next) = collector();
        let cancel = CancellationToken::new();
        let pump_task = tokio::spawn(pump.run(on_next, cancel.clone()));

        handle.add(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        pump_task.await.unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn overflow_spills_to_secondary_when_full() {
        let secondary: Box<dyn SimpleQueue<u32>> = Box::new(VecQueue::new());
        let (handle, pump) = Buffer::new(2, WhenFull::Overflow, Some(secondary));

        // Fill the primary, then two more spill over without blocking.
        for item in 1..=4u32 {
            handle.add(item).await.unwrap();
        }

        let (seen, on_next) = collector();
        let cancel = CancellationToken::new();
        let pump_task = tokio::spawn(pump.run(on_next, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        pump_task.await.unwrap().unwrap();

        // Primary items first, then the overflow.
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn high_priority_requeue_preempts_secondary() {
        let secondary: Box<dyn SimpleQueue<u32>> = Box::new(VecQueue::new());
        let (handle, pump) = Buffer::new(8, WhenFull::Block, Some(secondary));

        handle.requeue(100, false).await.unwrap();
        handle.requeue(1, true).await.unwrap();

        let (seen, on_next) = collector();
        let cancel = CancellationToken::new();
        let pump_task = tokio::spawn(pump.run(on_next, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        pump_task.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 100]);
    }

    #[derive(Clone, Default)]
    struct SharedQueue(Arc<StdMutex<std::collections::VecDeque<u32>>>);

    impl SimpleQueue<u32> for SharedQueue {
        fn enqueue(&mut self, item: u32) -> Result<(), u32> {
            self.0.lock().unwrap().push_back(item);
            Ok(())
        }

        fn dequeue(&mut self) -> Option<u32> {
            self.0.lock().unwrap().pop_front()
        }

        fn is_empty(&self) -> bool {
            self.0.lock().unwrap().is_empty()
        }
    }

    #[tokio::test]
    async fn cancel_drains_primary_to_secondary() {
        let secondary = SharedQueue::default();
        let (handle, pump) =
            Buffer::new(8, WhenFull::Block, Some(Box::new(secondary.clone())));

        let cancel = CancellationToken::new();
        cancel.cancel();

        for item in 0..3u32 {
            handle.add(item).await.unwrap();
        }

        let (seen, on_next) = collector();
        pump.run(on_next, cancel).await.unwrap();

        // Nothing was delivered downstream, and nothing was lost: the held
        // items were spilled to the secondary queue.
        assert!(seen.lock().unwrap().is_empty());
        let spilled: Vec<u32> = secondary.0.lock().unwrap().iter().copied().collect();
        assert_eq!(spilled, vec![0, 1, 2]);
    }
}
