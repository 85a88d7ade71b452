//! Glue between a source's envelope stream and a sink: a bounded batch
//! queue with optional durable overflow, a rate-limited drain loop, and
//! bookmark acknowledgment after successful sends.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use logtap_buffers::{batch_channel, BatchLimits, BatchReceiver, BatchSender, SimpleQueue};
use metrics::counter;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use crate::{
    bookmarks::BookmarkManager,
    event::{Envelope, LogRecord},
    sinks::util::Throttle,
};

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Snafu)]
pub enum SinkError {
    /// Worth retrying: throttling, timeouts, transient service trouble.
    #[snafu(display("recoverable sink failure: {reason}"))]
    Recoverable { reason: String },

    /// Not worth retrying: the batch is lost unless requeued by hand.
    #[snafu(display("nonrecoverable sink failure: {reason}"))]
    Nonrecoverable { reason: String },
}

/// The downstream half the pipeline drives. Implementations wrap a cloud
/// API, a socket, or a test double.
#[async_trait]
pub trait BatchSink: Send {
    async fn send(&mut self, batch: &[Envelope<LogRecord>]) -> Result<(), SinkError>;
}

/// Create the envelope channel between sources and a sink pipeline:
/// bounded to `capacity` items, assembling batches under `limits` on the
/// drain side, with an optional durable overflow tier.
pub fn envelope_channel(
    capacity: usize,
    limits: BatchLimits<Envelope<LogRecord>>,
    overflow: Option<Box<dyn SimpleQueue<Vec<Envelope<LogRecord>>>>>,
) -> (
    BatchSender<Envelope<LogRecord>>,
    BatchReceiver<Envelope<LogRecord>>,
) {
    batch_channel(capacity, limits, overflow)
}

/// Drain batches from `receiver` into `sink` until cancelled.
///
/// Each batch pays its way through the throttle before the send. A
/// successful send resets the throttle's error streak and acks the
/// highest position per bookmark key; a recoverable failure backs the
/// throttle off and requeues the batch (durably when the receiver has a
/// secondary tier). On cancellation, whatever is still buffered is
/// spilled to the secondary tier so no acked-but-unsent data is lost.
pub async fn run_sink(
    mut receiver: BatchReceiver<Envelope<LogRecord>>,
    mut sink: Box<dyn BatchSink>,
    mut throttle: Throttle,
    bookmarks: Arc<BookmarkManager>,
    cancel: CancellationToken,
) {
    let mut batch = Vec::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        batch.clear();
        let drained = receiver
            .drain_batch(&mut batch, DRAIN_TIMEOUT, &cancel)
            .await;
        if drained == 0 {
            continue;
        }

        let records = batch.len() as u64;
        let bytes: u64 = batch
            .iter()
            .map(|envelope| envelope.data().text.len() as u64)
            .sum();
        let delay = throttle.delay_ms(&[records, bytes]);
        if delay > 0 {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(delay)) => {}
                () = cancel.cancelled() => {}
            }
        }

        match sink.send(&batch).await {
            Ok(()) => {
                throttle.on_success();
                ack_batch(&bookmarks, &batch);
                counter!("records_sent").increment(records);
            }
            Err(SinkError::Recoverable { reason }) => {
                throttle.on_error();
                warn!(message = "Sink send failed; requeueing batch.", reason = reason.as_str());
                counter!("sink_recoverable_errors_total").increment(1);
                if receiver.has_secondary() {
                    let requeued = std::mem::take(&mut batch);
                    if let Err(error) = receiver.push_secondary(requeued) {
                        error!(message = "Failed to requeue batch.", %error);
                    }
                } else {
                    // No durable tier: retry in place after the backoff
                    // the throttle now imposes.
                    let retried = retry_inline(&mut sink, &mut throttle, &mut batch, &cancel).await;
                    if retried {
                        ack_batch(&bookmarks, &batch);
                    }
                }
            }
            Err(SinkError::Nonrecoverable { reason }) => {
                throttle.on_error();
                error!(
                    message = "Dropping batch after nonrecoverable sink failure.",
                    reason = reason.as_str(),
                    records,
                );
                counter!("sink_nonrecoverable_errors_total").increment(1);
            }
        }
    }

    match receiver.drain_to_secondary() {
        Ok(spilled) if spilled > 0 => {
            info!(message = "Spilled unsent items to secondary queue on shutdown.", spilled);
        }
        _ => {}
    }
}

/// Retry a failed batch in place until it sends, the error turns
/// nonrecoverable, or the pipeline is cancelled. Returns whether the
/// batch was eventually delivered.
async fn retry_inline(
    sink: &mut Box<dyn BatchSink>,
    throttle: &mut Throttle,
    batch: &mut Vec<Envelope<LogRecord>>,
    cancel: &CancellationToken,
) -> bool {
    while !cancel.is_cancelled() {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(500)) => {}
            () = cancel.cancelled() => return false,
        }
        match sink.send(batch).await {
            Ok(()) => {
                throttle.on_success();
                return true;
            }
            Err(SinkError::Recoverable { .. }) => throttle.on_error(),
            Err(SinkError::Nonrecoverable { reason }) => {
                error!(
                    message = "Dropping batch after nonrecoverable sink failure.",
                    reason = reason.as_str(),
                );
                return false;
            }
        }
    }
    false
}

/// Ack the highest position per bookmark key in one delivered batch.
fn ack_batch(bookmarks: &BookmarkManager, batch: &[Envelope<LogRecord>]) {
    let mut highest: HashMap<&str, i64> = HashMap::new();
    for envelope in batch {
        if let (Some(key), Some(position)) = (envelope.bookmark_key(), envelope.position()) {
            let slot = highest.entry(key).or_insert(position);
            *slot = (*slot).max(position);
        }
    }
    for (key, position) in highest {
        bookmarks.ack(key, position);
    }
}
