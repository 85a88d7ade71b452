pub mod batch;
pub mod throttle;

pub use batch::{Batch, BatchCollector, FlushReason};
pub use throttle::{AdaptivePolicy, Clock, SystemClock, Throttle, TokenBucket};
