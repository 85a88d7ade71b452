//! Record parsers over tailed line streams.
//!
//! Every parser consumes decoded lines from a [`LineSource`] and appends
//! structured [`ParsedRecord`]s to a caller-owned buffer. Progress is
//! tracked in a [`ParseContext`]: its `position` only ever advances past
//! fully-emitted records, so persisting it at any point yields an exact
//! resume point. Malformed input is never fatal; bad lines are logged,
//! counted, and skipped.

#![deny(clippy::all)]

pub mod delimited;
pub mod json_line;
pub mod regex_multiline;
pub mod single_line;
pub mod syslog;
pub mod timestamp;

use std::io;

use chrono::{DateTime, Utc};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

pub use self::delimited::{DelimitedParser, DelimitedParserOptions};
pub use self::json_line::{JsonLineParser, JsonLineParserOptions};
pub use self::regex_multiline::{
    RegexMultilineParser, RegexMultilineParserOptions, TimestampLogParser,
};
pub use self::single_line::SingleLineParser;
pub use self::syslog::SyslogParser;
pub use self::timestamp::TimeZoneKind;

/// Construction-time validation failures shared by all parsers.
#[derive(Debug, Snafu)]
pub enum ParserConfigError {
    #[snafu(display("{name} requires a timestamp format"))]
    MissingTimestampFormat { name: &'static str },

    #[snafu(display("headers and headers_pattern are mutually exclusive"))]
    ConflictingHeaders,

    #[snafu(display("timestamp_field requires timestamp_format"))]
    TimestampFieldWithoutFormat,

    #[snafu(display("delimiter must not be empty"))]
    EmptyDelimiter,

    #[snafu(display("invalid {what} pattern: {source}"))]
    InvalidPattern {
        what: &'static str,
        source: regex::Error,
    },
}

/// One decoded line with its location in the underlying stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    pub text: String,
    /// Byte offset just past this line's terminator.
    pub position: u64,
    /// 1-based line number.
    pub line_number: u64,
}

/// Anything that can hand out complete lines: a tailed file, an in-memory
/// test fixture, a network stream adapter.
pub trait LineSource {
    /// The next complete line, or `None` when no further line is
    /// available right now.
    fn next_line(&mut self) -> io::Result<Option<SourceLine>>;
}

impl LineSource for file_tail::FileWatcher {
    fn next_line(&mut self) -> io::Result<Option<SourceLine>> {
        Ok(self.read_line()?.map(|line| SourceLine {
            text: line.text,
            position: line.position,
            line_number: line.line_number,
        }))
    }
}

/// An in-memory line source over pre-split lines, used in tests and for
/// replaying buffered input.
#[derive(Debug, Default)]
pub struct VecLineSource {
    lines: std::collections::VecDeque<SourceLine>,
}

impl VecLineSource {
    pub fn new<I: IntoIterator<Item = String>>(lines: I) -> Self {
        let mut position = 0;
        let lines = lines
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                position += text.len() as u64 + 1;
                SourceLine {
                    text,
                    position,
                    line_number: index as u64 + 1,
                }
            })
            .collect();
        Self { lines }
    }
}

impl LineSource for VecLineSource {
    fn next_line(&mut self) -> io::Result<Option<SourceLine>> {
        Ok(self.lines.pop_front())
    }
}

/// A parsed record ready to be wrapped into an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// The raw record text; for multi-line records, the joined lines.
    pub text: String,
    /// The record's own timestamp when one could be parsed. `None` leaves
    /// the envelope to stamp ingestion time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Structured fields for parsers that extract them.
    pub fields: Option<serde_json::Map<String, serde_json::Value>>,
    /// Byte offset just past the record's last consumed line.
    pub position: u64,
    /// Line number of the record's first line.
    pub line_number: u64,
}

/// A record started but not yet complete, e.g. a multi-line record whose
/// continuation lines may still arrive.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub text: String,
    pub position: u64,
    pub line_number: u64,
}

/// Per-stream parser state, owned by the source and persisted alongside
/// its bookmark.
#[derive(Debug, Default)]
pub struct ParseContext {
    /// Byte offset past the last fully-emitted record.
    pub position: u64,
    /// Line number of the last fully-emitted record's final line.
    pub line_number: u64,
    /// Column headers learned from the stream (delimited parsers).
    pub headers: Option<Vec<String>>,
    /// A record awaiting its continuation lines (multi-line parsers).
    pub pending: Option<PendingRecord>,
}

impl ParseContext {
    fn commit(&mut self, record: &ParsedRecord) {
        self.position = record.position;
        self.line_number = record.line_number;
    }
}

/// The parser contract: pull lines, emit at most `max_records` records
/// into `out`, and stop early when cancelled. Returns the number of
/// records appended.
pub trait RecordParser: Send + Sync {
    fn parse_records(
        &self,
        context: &mut ParseContext,
        source: &mut dyn LineSource,
        out: &mut Vec<ParsedRecord>,
        max_records: usize,
        cancel: &CancellationToken,
    ) -> io::Result<usize>;

    /// Emit any record held back waiting for more input. Called when the
    /// stream has ended for good.
    fn flush(&self, _context: &mut ParseContext, _out: &mut Vec<ParsedRecord>) -> usize {
        0
    }
}
