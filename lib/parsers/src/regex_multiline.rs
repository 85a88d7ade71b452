use std::io;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{
    timestamp::{parse_timestamp, parse_timestamp_prefix, TimeZoneKind},
    LineSource, ParseContext, ParsedRecord, ParserConfigError, PendingRecord, RecordParser,
};

#[derive(Debug, Default)]
pub struct RegexMultilineParserOptions {
    /// Matches the first line of each record; everything up to the next
    /// match is a continuation.
    pub record_start_pattern: String,
    /// Optional field extraction over the whole (joined) record text,
    /// using named capture groups. A group named `timestamp` feeds the
    /// record timestamp when `timestamp_format` is set.
    pub extraction_pattern: Option<String>,
    pub timestamp_format: Option<String>,
    pub time_zone: TimeZoneKind,
}

enum StartMatcher {
    Pattern(Regex),
    /// A line starting with a parseable timestamp in the given format.
    Timestamp { format: String, zone: TimeZoneKind },
}

impl StartMatcher {
    fn is_start(&self, line: &str) -> bool {
        match self {
            StartMatcher::Pattern(regex) => regex.is_match(line),
            StartMatcher::Timestamp { format, zone } => {
                parse_timestamp_prefix(line, format, *zone).is_some()
            }
        }
    }
}

/// Accumulates continuation lines (stack traces, wrapped messages) onto
/// the record begun by the last start-matching line. A record is only
/// emitted once the next record begins or the stream is flushed, and the
/// context position never advances past an unfinished record.
pub struct RegexMultilineParser {
    start: StartMatcher,
    extraction: Option<Regex>,
    timestamp_format: Option<String>,
    time_zone: TimeZoneKind,
}

impl RegexMultilineParser {
    pub fn new(options: RegexMultilineParserOptions) -> Result<Self, ParserConfigError> {
        let start = Regex::new(&options.record_start_pattern).map_err(|source| {
            ParserConfigError::InvalidPattern {
                what: "record_start",
                source,
            }
        })?;
        let extraction = options
            .extraction_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ParserConfigError::InvalidPattern {
                    what: "extraction",
                    source,
                })
            })
            .transpose()?;

        Ok(Self {
            start: StartMatcher::Pattern(start),
            extraction,
            timestamp_format: options.timestamp_format,
            time_zone: options.time_zone,
        })
    }

    fn finish(&self, pending: PendingRecord) -> ParsedRecord {
        let mut fields = None;
        let mut timestamp = None;

        if let Some(extraction) = &self.extraction {
            if let Some(captures) = extraction.captures(&pending.text) {
                let mut map = serde_json::Map::new();
                for name in extraction.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        map.insert(
                            name.to_owned(),
                            serde_json::Value::String(value.as_str().to_owned()),
                        );
                    }
                }
                if let (Some(format), Some(raw)) = (
                    self.timestamp_format.as_deref(),
                    map.get("timestamp").and_then(|value| value.as_str()),
                ) {
                    timestamp = parse_timestamp(raw, format, self.time_zone);
                }
                fields = Some(map);
            }
        }

        if timestamp.is_none() {
            if let Some(format) = self.timestamp_format.as_deref() {
                let first_line = pending.text.lines().next().unwrap_or_default();
                timestamp =
                    parse_timestamp_prefix(first_line, format, self.time_zone)
                        .map(|(parsed, _)| parsed);
            }
        }

        ParsedRecord {
            text: pending.text,
            timestamp,
            fields,
            position: pending.position,
            line_number: pending.line_number,
        }
    }

    fn run(
        &self,
        context: &mut ParseContext,
        source: &mut dyn LineSource,
        out: &mut Vec<ParsedRecord>,
        max_records: usize,
        cancel: &CancellationToken,
    ) -> io::Result<usize> {
        let mut appended = 0;
        while appended < max_records && !cancel.is_cancelled() {
            let Some(line) = source.next_line()? else {
                break;
            };

            if self.start.is_start(&line.text) {
                if let Some(pending) = context.pending.take() {
                    let record = self.finish(pending);
                    context.commit(&record);
                    out.push(record);
                    appended += 1;
                }
                context.pending = Some(PendingRecord {
                    text: line.text,
                    position: line.position,
                    line_number: line.line_number,
                });
            } else if let Some(pending) = context.pending.as_mut() {
                pending.text.push('\n');
                pending.text.push_str(&line.text);
                pending.position = line.position;
            }
            // A continuation with no open record is dropped: the stream
            // began mid-record.
        }
        Ok(appended)
    }
}

impl RecordParser for RegexMultilineParser {
    fn parse_records(
        &self,
        context: &mut ParseContext,
        source: &mut dyn LineSource,
        out: &mut Vec<ParsedRecord>,
        max_records: usize,
        cancel: &CancellationToken,
    ) -> io::Result<usize> {
        self.run(context, source, out, max_records, cancel)
    }

    fn flush(&self, context: &mut ParseContext, out: &mut Vec<ParsedRecord>) -> usize {
        match context.pending.take() {
            Some(pending) => {
                let record = self.finish(pending);
                context.commit(&record);
                out.push(record);
                1
            }
            None => 0,
        }
    }
}

/// A multi-line parser whose record-start rule is "the line begins with a
/// timestamp in the configured format".
pub struct TimestampLogParser {
    inner: RegexMultilineParser,
}

impl TimestampLogParser {
    pub fn new(
        timestamp_format: String,
        time_zone: TimeZoneKind,
        extraction_pattern: Option<String>,
    ) -> Result<Self, ParserConfigError> {
        if timestamp_format.is_empty() {
            return Err(ParserConfigError::MissingTimestampFormat {
                name: "TimestampLogParser",
            });
        }
        let extraction = extraction_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ParserConfigError::InvalidPattern {
                    what: "extraction",
                    source,
                })
            })
            .transpose()?;

        Ok(Self {
            inner: RegexMultilineParser {
                start: StartMatcher::Timestamp {
                    format: timestamp_format.clone(),
                    zone: time_zone,
                },
                extraction,
                timestamp_format: Some(timestamp_format),
                time_zone,
            },
        })
    }
}

impl RecordParser for TimestampLogParser {
    fn parse_records(
        &self,
        context: &mut ParseContext,
        source: &mut dyn LineSource,
        out: &mut Vec<ParsedRecord>,
        max_records: usize,
        cancel: &CancellationToken,
    ) -> io::Result<usize> {
        self.inner
            .run(context, source, out, max_records, cancel)
    }

    fn flush(&self, context: &mut ParseContext, out: &mut Vec<ParsedRecord>) -> usize {
        self.inner.flush(context, out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::VecLineSource;

    fn parse_and_flush(
        parser: &dyn RecordParser,
        lines: Vec<String>,
    ) -> (Vec<ParsedRecord>, ParseContext) {
        let mut source = VecLineSource::new(lines);
        let mut context = ParseContext::default();
        let mut out = Vec::new();
        parser
            .parse_records(
                &mut context,
                &mut source,
                &mut out,
                usize::MAX,
                &CancellationToken::new(),
            )
            .unwrap();
        parser.flush(&mut context, &mut out);
        (out, context)
    }

    #[test]
    fn joins_continuation_lines() {
        let parser = RegexMultilineParser::new(RegexMultilineParserOptions {
            record_start_pattern: r"^\[".into(),
            ..Default::default()
        })
        .unwrap();

        let (records, _) = parse_and_flush(
            &parser,
            vec![
                "[ERROR] boom".into(),
                "  at frame one".into(),
                "  at frame two".into(),
                "[INFO] fine".into(),
            ],
        );

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text, "[ERROR] boom\n  at frame one\n  at frame two");
        assert_eq!(records[0].line_number, 1);
        assert_eq!(records[1].text, "[INFO] fine");
    }

    #[test]
    fn pending_record_does_not_advance_position() {
        let parser = RegexMultilineParser::new(RegexMultilineParserOptions {
            record_start_pattern: r"^\[".into(),
            ..Default::default()
        })
        .unwrap();

        let mut source = VecLineSource::new(vec![
            "[one] first".into(),
            "  tail".into(),
        ]);
        let mut context = ParseContext::default();
        let mut out = Vec::new();
        parser
            .parse_records(
                &mut context,
                &mut source,
                &mut out,
                usize::MAX,
                &CancellationToken::new(),
            )
            .unwrap();

        // Nothing emitted yet: the record may still grow.
        assert!(out.is_empty());
        assert_eq!(context.position, 0);

        parser.flush(&mut context, &mut out);
        assert_eq!(out.len(), 1);
        assert!(context.position > 0);
    }

    #[test]
    fn extraction_pattern_yields_fields_and_timestamp() {
        let parser = RegexMultilineParser::new(RegexMultilineParserOptions {
            record_start_pattern: r"^\d{4}-".into(),
            extraction_pattern: Some(
                r"(?s)^(?P<timestamp>\S+ \S+) (?P<level>\w+) (?P<message>.*)$".into(),
            ),
            timestamp_format: Some("%Y-%m-%d %H:%M:%S".into()),
            time_zone: TimeZoneKind::Utc,
        })
        .unwrap();

        let (records, _) = parse_and_flush(
            &parser,
            vec!["2024-03-01 08:45:00 WARN disk almost full".into()],
        );

        let fields = records[0].fields.as_ref().unwrap();
        assert_eq!(fields["level"], "WARN");
        assert_eq!(fields["message"], "disk almost full");
        assert_eq!(
            records[0].timestamp.unwrap().to_rfc3339(),
            "2024-03-01T08:45:00+00:00"
        );
    }

    #[test]
    fn timestamp_log_parser_uses_parseability_as_start() {
        let parser = TimestampLogParser::new(
            "%Y-%m-%d %H:%M:%S".into(),
            TimeZoneKind::Utc,
            None,
        )
        .unwrap();

        let (records, _) = parse_and_flush(
            &parser,
            vec![
                "2024-03-01 08:00:00 started".into(),
                "   continuation".into(),
                "2024-03-01 08:00:05 stopped".into(),
            ],
        );

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text, "2024-03-01 08:00:00 started\n   continuation");
        assert_eq!(
            records[1].timestamp.unwrap().to_rfc3339(),
            "2024-03-01T08:00:05+00:00"
        );
    }

    #[test]
    fn empty_timestamp_format_fails_fast() {
        assert!(matches!(
            TimestampLogParser::new(String::new(), TimeZoneKind::Utc, None),
            Err(ParserConfigError::MissingTimestampFormat { .. })
        ));
    }
}
