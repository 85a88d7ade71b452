//! The logtap buffering layer.
//!
//! This library implements the queues that sit between sources and sinks:
//! a bounded in-memory channel with batched draining, a primary/secondary
//! buffer that can spill into an overflow tier, and a file-backed durable
//! FIFO that survives process restarts. All variants are bounded.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod batch_queue;
pub mod buffer;
mod limits;
pub mod persistent;

pub use batch_queue::{batch_channel, BatchReceiver, BatchSender};
pub use buffer::{Buffer, BufferHandle, BufferPump, WhenFull};
pub use limits::{BatchLimits, Counter, LimitsError};
pub use persistent::PersistentQueue;

/// A best-effort FIFO used as the secondary tier behind the in-memory
/// primary. Implementations may be durable (see [`PersistentQueue`]) or
/// plain in-memory queues.
///
/// `enqueue` hands the item back on failure so the caller can fall through
/// to another tier instead of losing it.
pub trait SimpleQueue<T>: Send {
    fn enqueue(&mut self, item: T) -> Result<(), T>;

    fn dequeue(&mut self) -> Option<T>;

    fn is_empty(&self) -> bool;
}

/// An unbounded in-memory `SimpleQueue`, mostly useful in tests and as the
/// low-priority tier when durability is not required.
#[derive(Debug, Default)]
pub struct VecQueue<T> {
    items: std::collections::VecDeque<T>,
}

impl<T> VecQueue<T> {
    pub fn new() -> Self {
        Self {
            items: std::collections::VecDeque::new(),
        }
    }
}

impl<T: Send> SimpleQueue<T> for VecQueue<T> {
    fn enqueue(&mut self, item: T) -> Result<(), T> {
        self.items.push_back(item);
        Ok(())
    }

    fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
