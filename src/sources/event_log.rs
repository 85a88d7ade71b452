//! A source that polls a platform event log through an [`EventLogReader`]
//! seam, dedupes duplicate deliveries, applies registered filters, and
//! persists its position as a `{channel, record_id}` bookmark.
//!
//! The concrete reader (Windows event log, journald, a test double) is an
//! external collaborator; this module owns the polling cadence, the
//! reader/processor task pair, and the bookmark lifecycle.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{Map, Value};
use snafu::ensure;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{InitialPosition, SourceConfigError};
use crate::{
    bookmarks::BookmarkManager,
    event::{Envelope, LogRecord},
};

/// One record read from the platform log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub record_id: u64,
    pub created_at: DateTime<Utc>,
    pub provider: String,
    pub level: String,
    pub message: String,
    /// Raw event payload fields, included when the source is configured
    /// to carry them.
    pub event_data: Option<Map<String, Value>>,
}

/// The platform seam. Implementations must return records in ascending
/// `record_id` order with ids strictly greater than `after`.
pub trait EventLogReader: Send {
    /// Whether the underlying subsystem is currently usable.
    fn dependency_available(&self) -> bool;

    /// The newest record id in the log, used to seek to end-of-stream.
    fn latest_record_id(&mut self) -> io::Result<u64>;

    /// Read up to `max` records with `record_id > after`.
    fn read_batch(&mut self, after: u64, max: usize) -> io::Result<Vec<EventRecord>>;
}

/// Named record filters, registered before the source starts; a config
/// naming an unknown filter fails fast.
pub type EventFilter = Arc<dyn Fn(&EventRecord) -> bool + Send + Sync>;

#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<String, EventFilter>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, filter: EventFilter) {
        self.filters.insert(name.into(), filter);
    }

    fn resolve(&self, names: &[String]) -> Result<Vec<EventFilter>, SourceConfigError> {
        names
            .iter()
            .map(|name| {
                self.filters
                    .get(name)
                    .cloned()
                    .ok_or_else(|| SourceConfigError::UnknownFilter { name: name.clone() })
            })
            .collect()
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_min_reader_delay_ms() -> u64 {
    100
}

fn default_max_reader_delay_ms() -> u64 {
    5000
}

fn default_delay_threshold() -> usize {
    10
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_dependency_poll_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EventLogSourceConfig {
    pub id: String,

    /// The log channel to poll, e.g. `"Security"`.
    pub log_name: String,

    /// Vendor-specific query passed through to the reader; unused here.
    #[serde(default)]
    pub query: Option<String>,

    #[serde(default)]
    pub include_event_data: bool,

    /// Names of filters registered in the [`FilterRegistry`].
    #[serde(default)]
    pub custom_filters: Vec<String>,

    #[serde(default)]
    pub initial_position: InitialPosition,

    #[serde(default)]
    pub initial_position_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub bookmark_on_buffer_flush: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_min_reader_delay_ms")]
    pub min_reader_delay_ms: u64,

    #[serde(default = "default_max_reader_delay_ms")]
    pub max_reader_delay_ms: u64,

    /// Batches at least this full halve the poll delay; smaller ones
    /// double it.
    #[serde(default = "default_delay_threshold")]
    pub delay_threshold: usize,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_dependency_poll_ms")]
    pub dependency_poll_ms: u64,
}

pub struct EventLogSource {
    config: EventLogSourceConfig,
    reader: Box<dyn EventLogReader>,
    filters: Vec<EventFilter>,
    bookmarks: Arc<BookmarkManager>,
}

impl EventLogSource {
    pub fn new(
        config: EventLogSourceConfig,
        reader: Box<dyn EventLogReader>,
        registry: &FilterRegistry,
        bookmarks: Arc<BookmarkManager>,
    ) -> Result<Self, SourceConfigError> {
        ensure!(!config.id.is_empty(), super::EmptyIdSnafu);
        ensure!(
            config.initial_position != InitialPosition::Timestamp
                || config.initial_position_timestamp.is_some(),
            super::MissingInitialTimestampSnafu
        );
        let filters = registry.resolve(&config.custom_filters)?;

        Ok(Self {
            config,
            reader,
            filters,
            bookmarks,
        })
    }

    /// Run the reader and processor until cancelled.
    ///
    /// The reader task polls the platform log with an adaptive delay and
    /// pushes matching records into a bounded channel; the processor
    /// drains it, emits envelopes, and advances the bookmark position.
    pub async fn run(
        mut self,
        output: mpsc::Sender<Envelope<LogRecord>>,
        cancel: CancellationToken,
    ) {
        info!(
            message = "Event log source starting.",
            source_id = self.config.id.as_str(),
            log_name = self.config.log_name.as_str(),
        );

        let channel = self.config.log_name.clone();
        self.bookmarks.register_source(
            &self.config.id,
            Box::new(move |view| {
                view.position()
                    .map(|position| render_bookmark(&channel, position.max(0) as u64))
            }),
        );

        let mut start_after = self
            .bookmarks
            .load(&self.config.id)
            .and_then(|bytes| parse_bookmark(&bytes))
            .filter(|(channel, _)| *channel == self.config.log_name)
            .map(|(_, record_id)| record_id);

        let (record_tx, record_rx) = mpsc::channel(self.config.channel_capacity);

        let processor = tokio::spawn(process_records(
            record_rx,
            output,
            self.config.id.clone(),
            self.config.bookmark_on_buffer_flush,
            Arc::clone(&self.bookmarks),
            cancel.clone(),
        ));

        self.read_loop(&mut start_after, record_tx, &cancel).await;

        // Dropping the sender lets the processor drain and finish.
        if let Err(error) = processor.await {
            error!(message = "Event processor task failed.", %error);
        }

        info!(
            message = "Event log source stopped.",
            source_id = self.config.id.as_str(),
        );
    }

    async fn read_loop(
        &mut self,
        start_after: &mut Option<u64>,
        record_tx: mpsc::Sender<EventRecord>,
        cancel: &CancellationToken,
    ) {
        let mut delay_ms = self.config.min_reader_delay_ms;
        let mut prev_record_id = None;
        let mut seeked = false;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            if !self.reader.dependency_available() {
                warn!(
                    message = "Event log dependency unavailable; polling for recovery.",
                    log_name = self.config.log_name.as_str(),
                );
                // Discard the seek so recovery re-anchors under the
                // current initial-position policy.
                seeked = false;
                prev_record_id = None;
                let wait = Duration::from_millis(self.config.dependency_poll_ms);
                tokio::select! {
                    () = tokio::time::sleep(wait) => continue,
                    () = cancel.cancelled() => return,
                }
            }

            if !seeked {
                if start_after.is_none()
                    && self.config.initial_position == InitialPosition::Eos
                {
                    match self.reader.latest_record_id() {
                        Ok(latest) => *start_after = Some(latest),
                        Err(error) => {
                            error!(message = "Failed to seek to end of log.", %error);
                            tokio::select! {
                                () = tokio::time::sleep(Duration::from_millis(delay_ms)) => continue,
                                () = cancel.cancelled() => return,
                            }
                        }
                    }
                }
                seeked = true;
            }

            let after = start_after.unwrap_or(0);
            let batch = match self.reader.read_batch(after, self.config.batch_size) {
                Ok(batch) => batch,
                Err(error) => {
                    error!(message = "Event log read failed; will retry.", %error);
                    counter!("event_log_read_errors_total").increment(1);
                    Vec::new()
                }
            };
            let batch_count = batch.len();

            for record in batch {
                // The platform reader can fire the same record twice at a
                // poll boundary.
                if prev_record_id == Some(record.record_id) {
                    continue;
                }
                prev_record_id = Some(record.record_id);
                *start_after = Some(record.record_id);

                if let (InitialPosition::Timestamp, Some(cutoff)) = (
                    self.config.initial_position,
                    self.config.initial_position_timestamp,
                ) {
                    if record.created_at < cutoff {
                        continue;
                    }
                }
                if !self.filters.iter().all(|filter| filter(&record)) {
                    continue;
                }

                let record = if self.config.include_event_data {
                    record
                } else {
                    EventRecord {
                        event_data: None,
                        ..record
                    }
                };

                tokio::select! {
                    sent = record_tx.send(record) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    () = cancel.cancelled() => return,
                }
            }

            // Keep pace with a busy log, ease off an idle one.
            delay_ms = if batch_count >= self.config.delay_threshold {
                (delay_ms / 2).max(self.config.min_reader_delay_ms)
            } else {
                (delay_ms * 2).min(self.config.max_reader_delay_ms)
            };

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                () = cancel.cancelled() => return,
            }
        }
    }
}

async fn process_records(
    mut records: mpsc::Receiver<EventRecord>,
    output: mpsc::Sender<Envelope<LogRecord>>,
    source_id: String,
    bookmark_on_buffer_flush: bool,
    bookmarks: Arc<BookmarkManager>,
    cancel: CancellationToken,
) {
    while let Some(record) = records.recv().await {
        let record_id = record.record_id;
        let timestamp = record.created_at;

        let mut fields = record.event_data.unwrap_or_default();
        fields.insert("record_id".into(), Value::from(record_id));
        fields.insert("provider".into(), Value::String(record.provider));
        fields.insert("level".into(), Value::String(record.level));
        fields.insert("message".into(), Value::String(record.message.clone()));

        let envelope = Envelope::new(
            LogRecord {
                text: record.message,
                fields: Some(fields),
            },
            Some(timestamp),
        )
        .with_bookmark(source_id.clone(), record_id as i64);

        tokio::select! {
            sent = output.send(envelope) => {
                if sent.is_err() {
                    warn!(message = "Output channel closed; stopping event processor.");
                    return;
                }
            }
            () = cancel.cancelled() => return,
        }
        counter!("records_read").increment(1);

        if !bookmark_on_buffer_flush {
            bookmarks.ack(&source_id, record_id as i64);
            if let Err(error) = bookmarks.commit_now(&source_id) {
                error!(message = "Failed to write event log bookmark.", %error);
            }
        }
    }
}

/// Serialize a `{channel, record_id}` bookmark in the stable interchange
/// format: a JSON object wrapping the platform's bookmark XML.
pub fn render_bookmark(channel: &str, record_id: u64) -> Vec<u8> {
    let text = format!(
        "<BookmarkList>\n<Bookmark Channel='{channel}' RecordId='{record_id}' IsCurrent='true'/>\n</BookmarkList>"
    );
    serde_json::json!({ "BookmarkText": text }).to_string().into_bytes()
}

/// Parse bytes produced by [`render_bookmark`]. Returns `None` on any
/// deviation so a corrupt bookmark falls back to a fresh start.
pub fn parse_bookmark(bytes: &[u8]) -> Option<(String, u64)> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let text = value.get("BookmarkText")?.as_str()?;

    let channel = attribute_value(text, "Channel")?;
    let record_id = attribute_value(text, "RecordId")?.parse().ok()?;
    Some((channel.to_owned(), record_id))
}

fn attribute_value<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{name}='");
    let start = text.find(&marker)? + marker.len();
    let end = text[start..].find('\'')? + start;
    Some(&text[start..end])
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn bookmark_round_trip() {
        let bytes = render_bookmark("Security", 4242);
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("<Bookmark Channel='Security' RecordId='4242' IsCurrent='true'/>"));
        assert_eq!(parse_bookmark(&bytes), Some(("Security".to_owned(), 4242)));
    }

    #[test]
    fn corrupt_bookmark_is_none() {
        assert_eq!(parse_bookmark(b"not json"), None);
        assert_eq!(parse_bookmark(br#"{"BookmarkText": "<BookmarkList/>"}"#), None);
    }

    /// An in-memory event log shared between the test and the reader.
    #[derive(Clone, Default)]
    pub(super) struct MockLog {
        records: Arc<Mutex<Vec<EventRecord>>>,
        available: Arc<std::sync::atomic::AtomicBool>,
    }

    impl MockLog {
        pub(super) fn new() -> Self {
            let log = Self::default();
            log.available
                .store(true, std::sync::atomic::Ordering::SeqCst);
            log
        }

        pub(super) fn append(&self, count: usize) {
            let mut records = self.records.lock().unwrap();
            let next_id = records.last().map(|r| r.record_id + 1).unwrap_or(1);
            for offset in 0..count as u64 {
                records.push(EventRecord {
                    record_id: next_id + offset,
                    created_at: Utc::now(),
                    provider: "test".into(),
                    level: "Information".into(),
                    message: format!("event {}", next_id + offset),
                    event_data: None,
                });
            }
        }

        pub(super) fn reader(&self) -> MockReader {
            MockReader { log: self.clone() }
        }
    }

    pub(super) struct MockReader {
        log: MockLog,
    }

    impl EventLogReader for MockReader {
        fn dependency_available(&self) -> bool {
            self.log
                .available
                .load(std::sync::atomic::Ordering::SeqCst)
        }

        fn latest_record_id(&mut self) -> io::Result<u64> {
            Ok(self
                .log
                .records
                .lock()
                .unwrap()
                .last()
                .map(|r| r.record_id)
                .unwrap_or(0))
        }

        fn read_batch(&mut self, after: u64, max: usize) -> io::Result<Vec<EventRecord>> {
            Ok(self
                .log
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|record| record.record_id > after)
                .take(max)
                .cloned()
                .collect())
        }
    }

    fn config(id: &str) -> EventLogSourceConfig {
        EventLogSourceConfig {
            id: id.into(),
            log_name: "Application".into(),
            query: None,
            include_event_data: false,
            custom_filters: Vec::new(),
            initial_position: InitialPosition::Bookmark,
            initial_position_timestamp: None,
            bookmark_on_buffer_flush: true,
            batch_size: 10,
            min_reader_delay_ms: 5,
            max_reader_delay_ms: 40,
            delay_threshold: 5,
            channel_capacity: 64,
            dependency_poll_ms: 20,
        }
    }

    fn manager() -> (Arc<BookmarkManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = BookmarkManager::new(
            crate::bookmarks::BookmarkStore::new(dir.path()).unwrap(),
            Duration::from_secs(20),
        );
        (manager, dir)
    }

    async fn collect(
        source: EventLogSource,
        expected: usize,
        timeout: Duration,
    ) -> Vec<Envelope<LogRecord>> {
        let (tx, mut rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(source.run(tx, cancel.clone()));

        let mut got = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while got.len() < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(envelope)) => got.push(envelope),
                _ => break,
            }
        }
        cancel.cancel();
        task.await.unwrap();
        got
    }

    #[tokio::test]
    async fn unknown_filter_fails_fast() {
        let (bookmarks, _dir) = manager();
        let log = MockLog::new();
        let mut cfg = config("evt");
        cfg.custom_filters = vec!["nope".into()];

        let result = EventLogSource::new(
            cfg,
            Box::new(log.reader()),
            &FilterRegistry::new(),
            bookmarks,
        );
        assert!(matches!(
            result,
            Err(SourceConfigError::UnknownFilter { .. })
        ));
    }

    #[tokio::test]
    async fn reads_records_in_order_with_dedupe() {
        let (bookmarks, _dir) = manager();
        let log = MockLog::new();
        log.append(5);

        let source = EventLogSource::new(
            config("evt"),
            Box::new(log.reader()),
            &FilterRegistry::new(),
            bookmarks,
        )
        .unwrap();

        let got = collect(source, 5, Duration::from_secs(5)).await;
        assert_eq!(got.len(), 5);
        let ids: Vec<i64> = got.iter().filter_map(|e| e.position()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(got[0].data().text, "event 1");
    }

    #[tokio::test]
    async fn custom_filter_drops_records() {
        let (bookmarks, _dir) = manager();
        let log = MockLog::new();
        log.append(4);

        let mut registry = FilterRegistry::new();
        registry.register(
            "even_only",
            Arc::new(|record: &EventRecord| record.record_id % 2 == 0),
        );
        let mut cfg = config("evt");
        cfg.custom_filters = vec!["even_only".into()];

        let source = EventLogSource::new(
            cfg,
            Box::new(log.reader()),
            &registry,
            bookmarks,
        )
        .unwrap();

        let got = collect(source, 2, Duration::from_secs(5)).await;
        let ids: Vec<i64> = got.iter().filter_map(|e| e.position()).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[tokio::test]
    async fn eos_start_skips_existing_records() {
        let (bookmarks, _dir) = manager();
        let log = MockLog::new();
        log.append(3);

        let mut cfg = config("evt");
        cfg.initial_position = InitialPosition::Eos;
        let source = EventLogSource::new(
            cfg,
            Box::new(log.reader()),
            &FilterRegistry::new(),
            Arc::clone(&bookmarks),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(source.run(tx, cancel.clone()));

        // Give the source a moment to seek, then write fresh records.
        tokio::time::sleep(Duration::from_millis(50)).await;
        log.append(2);

        let mut got = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while got.len() < 2 {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(envelope)) => got.push(envelope),
                _ => break,
            }
        }
        cancel.cancel();
        task.await.unwrap();

        let ids: Vec<i64> = got.iter().filter_map(|e| e.position()).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn bookmark_on_flush_replays_unacked_records() {
        let (bookmarks, _dir) = manager();
        let log = MockLog::new();
        log.append(3);

        // First run: emit everything, ack nothing.
        let source = EventLogSource::new(
            config("evt"),
            Box::new(log.reader()),
            &FilterRegistry::new(),
            Arc::clone(&bookmarks),
        )
        .unwrap();
        let first = collect(source, 3, Duration::from_secs(5)).await;
        assert_eq!(first.len(), 3);
        bookmarks.flush_dirty();

        // Restart: the same records come back, because no ack advanced
        // the bookmark.
        let source = EventLogSource::new(
            config("evt"),
            Box::new(log.reader()),
            &FilterRegistry::new(),
            Arc::clone(&bookmarks),
        )
        .unwrap();
        let second = collect(source, 3, Duration::from_secs(5)).await;
        let ids: Vec<i64> = second.iter().filter_map(|e| e.position()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        // Now the sink acks and the bookmark is flushed.
        for envelope in &second {
            bookmarks.ack(envelope.bookmark_key().unwrap(), envelope.position().unwrap());
        }
        bookmarks.flush_dirty();

        // Third run: nothing until a new record is written.
        let source = EventLogSource::new(
            config("evt"),
            Box::new(log.reader()),
            &FilterRegistry::new(),
            Arc::clone(&bookmarks),
        )
        .unwrap();
        log.append(1);
        let third = collect(source, 1, Duration::from_secs(5)).await;
        let ids: Vec<i64> = third.iter().filter_map(|e| e.position()).collect();
        assert_eq!(ids, vec![4]);
    }
}
