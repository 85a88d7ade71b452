use std::io;

use metrics::counter;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{
    timestamp::{parse_timestamp, TimeZoneKind},
    LineSource, ParseContext, ParsedRecord, ParserConfigError, RecordParser,
};

/// Options for [`DelimitedParser`]. Header rows may be declared up front,
/// recognized by a pattern, or learned from the first line of the stream;
/// when a header row is re-recognized mid-file the new headers replace the
/// old ones.
#[derive(Debug, Default)]
pub struct DelimitedParserOptions {
    pub delimiter: String,
    pub headers: Option<Vec<String>>,
    /// Recognizes header rows. An optional `Headers` capture group narrows
    /// the part of the line holding the column names.
    pub headers_pattern: Option<String>,
    /// Learn headers from the first data line (tab-separated exports that
    /// carry their header row unmarked).
    pub headers_from_first_line: bool,
    /// Lines matching this are dropped as comments.
    pub comment_pattern: Option<String>,
    /// When set, lines NOT matching this are dropped as comments or
    /// continuations.
    pub record_pattern: Option<String>,
    /// RFC-4180-style quote handling. Defaults to on when the delimiter is
    /// a comma.
    pub csv_escape_mode: Option<bool>,
    /// Either a plain column name or a composite template such as
    /// `"{Date} {Time}"`.
    pub timestamp_field: Option<String>,
    pub timestamp_format: Option<String>,
    pub time_zone: TimeZoneKind,
}

/// Splits delimited text (CSV, TSV, space-separated service logs) into
/// field maps keyed by the active headers.
pub struct DelimitedParser {
    delimiter: String,
    headers: Option<Vec<String>>,
    headers_pattern: Option<Regex>,
    headers_from_first_line: bool,
    comment_pattern: Option<Regex>,
    record_pattern: Option<Regex>,
    csv_escape: bool,
    timestamp_field: Option<String>,
    timestamp_format: Option<String>,
    time_zone: TimeZoneKind,
}

fn compile(what: &'static str, pattern: &str) -> Result<Regex, ParserConfigError> {
    Regex::new(pattern).map_err(|source| ParserConfigError::InvalidPattern { what, source })
}

impl DelimitedParser {
    pub fn new(options: DelimitedParserOptions) -> Result<Self, ParserConfigError> {
        if options.delimiter.is_empty() {
            return Err(ParserConfigError::EmptyDelimiter);
        }
        if options.headers.is_some() && options.headers_pattern.is_some() {
            return Err(ParserConfigError::ConflictingHeaders);
        }
        if options.timestamp_field.is_some() && options.timestamp_format.is_none() {
            return Err(ParserConfigError::TimestampFieldWithoutFormat);
        }

        let headers_pattern = options
            .headers_pattern
            .as_deref()
            .map(|pattern| compile("headers", pattern))
            .transpose()?;
        let comment_pattern = options
            .comment_pattern
            .as_deref()
            .map(|pattern| compile("comment", pattern))
            .transpose()?;
        let record_pattern = options
            .record_pattern
            .as_deref()
            .map(|pattern| compile("record", pattern))
            .transpose()?;

        let csv_escape = options
            .csv_escape_mode
            .unwrap_or(options.delimiter == ",");

        Ok(Self {
            delimiter: options.delimiter,
            headers: options.headers,
            headers_pattern,
            headers_from_first_line: options.headers_from_first_line,
            comment_pattern,
            record_pattern,
            csv_escape,
            timestamp_field: options.timestamp_field,
            timestamp_format: options.timestamp_format,
            time_zone: options.time_zone,
        })
    }

    /// IIS W3C extended log format: space separated, `#`-prefixed
    /// directives, headers declared by `#Fields:` lines, UTC timestamps
    /// split over `date` and `time` columns.
    pub fn w3svc() -> Self {
        Self::new(DelimitedParserOptions {
            delimiter: " ".into(),
            headers_pattern: Some(r"^#Fields:\s*(?P<Headers>.*)$".into()),
            comment_pattern: Some("^#".into()),
            timestamp_field: Some("{date} {time}".into()),
            timestamp_format: Some("%Y-%m-%d %H:%M:%S".into()),
            time_zone: TimeZoneKind::Utc,
            ..Default::default()
        })
        .expect("w3svc preset is valid")
    }

    /// SharePoint ULS trace logs: tab separated, header row leads the
    /// file, local-time `Timestamp` column.
    pub fn uls() -> Self {
        Self::new(DelimitedParserOptions {
            delimiter: "\t".into(),
            headers_from_first_line: true,
            timestamp_field: Some("{Timestamp}".into()),
            timestamp_format: Some("%m/%d/%Y %H:%M:%S%.f".into()),
            time_zone: TimeZoneKind::Local,
            ..Default::default()
        })
        .expect("uls preset is valid")
    }

    /// Exchange message tracking logs: CSV with quoting, `#`-prefixed
    /// directives, ISO-8601 `date-time` column.
    pub fn exchange() -> Self {
        Self::new(DelimitedParserOptions {
            delimiter: ",".into(),
            headers_pattern: Some(r"^#Fields:\s*(?P<Headers>.*)$".into()),
            comment_pattern: Some("^#".into()),
            timestamp_field: Some("{date-time}".into()),
            timestamp_format: Some("%Y-%m-%dT%H:%M:%S%.fZ".into()),
            time_zone: TimeZoneKind::Utc,
            ..Default::default()
        })
        .expect("exchange preset is valid")
    }

    fn split(&self, line: &str) -> Vec<String> {
        if self.csv_escape {
            split_csv(line, &self.delimiter)
        } else {
            line.split(self.delimiter.as_str())
                .map(str::to_owned)
                .collect()
        }
    }

    fn split_headers(&self, text: &str) -> Vec<String> {
        self.split(text)
            .into_iter()
            .map(|header| header.trim().to_owned())
            .filter(|header| !header.is_empty())
            .collect()
    }

    fn timestamp_of(
        &self,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        let template = self.timestamp_field.as_deref()?;
        let format = self.timestamp_format.as_deref()?;

        let mut value = String::new();
        if template.contains('{') {
            let mut rest = template;
            while let Some(open) = rest.find('{') {
                value.push_str(&rest[..open]);
                let Some(close) = rest[open..].find('}') else {
                    return None;
                };
                let name = &rest[open + 1..open + close];
                value.push_str(fields.get(name)?.as_str()?);
                rest = &rest[open + close + 1..];
            }
            value.push_str(rest);
        } else {
            value.push_str(fields.get(template)?.as_str()?);
        }

        parse_timestamp(&value, format, self.time_zone)
    }
}

impl RecordParser for DelimitedParser {
    fn parse_records(
        &self,
        context: &mut ParseContext,
        source: &mut dyn LineSource,
        out: &mut Vec<ParsedRecord>,
        max_records: usize,
        cancel: &CancellationToken,
    ) -> io::Result<usize> {
        if context.headers.is_none() {
            context.headers = self.headers.clone();
        }

        let mut appended = 0;
        while appended < max_records && !cancel.is_cancelled() {
            let Some(line) = source.next_line()? else {
                break;
            };

            // Pre-allocated log files show up as runs of NUL bytes before
            // real content lands; strip them and skip what remains empty.
            let text = line.text.trim_matches('\0');
            if text.is_empty() {
                continue;
            }

            if let Some(pattern) = &self.headers_pattern {
                if let Some(captures) = pattern.captures(text) {
                    let headers_text = captures
                        .name("Headers")
                        .map(|m| m.as_str())
                        .unwrap_or(text);
                    context.headers = Some(self.split_headers(headers_text));
                    continue;
                }
            }
            if self.headers_from_first_line && context.headers.is_none() {
                context.headers = Some(self.split_headers(text));
                continue;
            }

            if let Some(pattern) = &self.comment_pattern {
                if pattern.is_match(text) {
                    continue;
                }
            }
            if let Some(pattern) = &self.record_pattern {
                if !pattern.is_match(text) {
                    continue;
                }
            }

            let values = self.split(text);
            let mut fields = serde_json::Map::with_capacity(values.len());
            match &context.headers {
                Some(headers) => {
                    for (header, value) in headers.iter().zip(values) {
                        fields.insert(header.clone(), serde_json::Value::String(value));
                    }
                }
                None => {
                    for (index, value) in values.into_iter().enumerate() {
                        fields.insert(index.to_string(), serde_json::Value::String(value));
                    }
                }
            }

            let timestamp = self.timestamp_of(&fields);
            if self.timestamp_field.is_some() && timestamp.is_none() {
                counter!("parser_timestamp_failures_total").increment(1);
            }

            let record = ParsedRecord {
                text: text.to_owned(),
                timestamp,
                fields: Some(fields),
                position: line.position,
                line_number: line.line_number,
            };
            context.commit(&record);
            out.push(record);
            appended += 1;
        }
        Ok(appended)
    }
}

/// Split one line on `delimiter` honoring RFC-4180 quoting: fields may be
/// wrapped in double quotes, inside which the delimiter is literal and
/// `""` escapes a quote.
fn split_csv(line: &str, delimiter: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;
    let delimiter_char = delimiter.chars().next().unwrap_or(',');

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(ch);
            }
        } else if ch == '"' && current.is_empty() {
            in_quotes = true;
        } else if ch == delimiter_char {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::VecLineSource;

    fn parse_all(parser: &DelimitedParser, lines: Vec<String>) -> (Vec<ParsedRecord>, ParseContext) {
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
        (out, context)
    }

    fn field<'a>(record: &'a ParsedRecord, name: &str) -> &'a str {
        record
            .fields
            .as_ref()
            .unwrap()
            .get(name)
            .and_then(|value| value.as_str())
            .unwrap()
    }

    #[test]
    fn conflicting_header_options_fail_fast() {
        let result = DelimitedParser::new(DelimitedParserOptions {
            delimiter: ",".into(),
            headers: Some(vec!["a".into()]),
            headers_pattern: Some("^#".into()),
            ..Default::default()
        });
        assert!(matches!(result, Err(ParserConfigError::ConflictingHeaders)));
    }

    #[test]
    fn timestamp_field_requires_format() {
        let result = DelimitedParser::new(DelimitedParserOptions {
            delimiter: ",".into(),
            timestamp_field: Some("ts".into()),
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(ParserConfigError::TimestampFieldWithoutFormat)
        ));
    }

    #[test]
    fn w3svc_learns_headers_and_composite_timestamp() {
        let parser = DelimitedParser::w3svc();
        let (records, context) = parse_all(
            &parser,
            vec![
                "#Software: Internet Information Services 10.0".into(),
                "#Fields: date time s-ip cs-method".into(),
                "2024-03-01 12:00:00 10.0.0.1 GET".into(),
            ],
        );

        assert_eq!(records.len(), 1);
        assert_eq!(field(&records[0], "cs-method"), "GET");
        assert_eq!(
            records[0].timestamp.unwrap().to_rfc3339(),
            "2024-03-01T12:00:00+00:00"
        );
        assert_eq!(
            context.headers.unwrap(),
            vec!["date", "time", "s-ip", "cs-method"]
        );
    }

    #[test]
    fn relearned_headers_replace_old_ones() {
        let parser = DelimitedParser::w3svc();
        let (records, _) = parse_all(
            &parser,
            vec![
                "#Fields: date time s-ip".into(),
                "2024-03-01 12:00:00 10.0.0.1".into(),
                "#Fields: date time c-ip".into(),
                "2024-03-01 12:00:01 10.0.0.2".into(),
            ],
        );

        assert_eq!(field(&records[0], "s-ip"), "10.0.0.1");
        assert!(records[1].fields.as_ref().unwrap().get("s-ip").is_none());
        assert_eq!(field(&records[1], "c-ip"), "10.0.0.2");
    }

    #[test]
    fn csv_quoting_keeps_embedded_delimiters() {
        let parser = DelimitedParser::new(DelimitedParserOptions {
            delimiter: ",".into(),
            headers: Some(vec!["name".into(), "note".into()]),
            ..Default::default()
        })
        .unwrap();
        let (records, _) =
            parse_all(&parser, vec![r#"alpha,"one, ""two"", three""#.into()]);

        assert_eq!(field(&records[0], "name"), "alpha");
        assert_eq!(field(&records[0], "note"), r#"one, "two", three"#);
    }

    #[test]
    fn uls_first_line_headers() {
        let parser = DelimitedParser::uls();
        let (records, _) = parse_all(
            &parser,
            vec![
                "Timestamp\tProcess\tMessage".into(),
                "03/01/2024 12:00:00.12\tw3wp.exe\thello".into(),
            ],
        );

        assert_eq!(records.len(), 1);
        assert_eq!(field(&records[0], "Process"), "w3wp.exe");
        assert!(records[0].timestamp.is_some());
    }

    #[test]
    fn nul_expansion_runs_are_skipped() {
        let parser = DelimitedParser::w3svc();
        let (records, context) = parse_all(
            &parser,
            vec![
                "#Fields: date time s-ip".into(),
                "2024-03-01 12:00:00 10.0.0.1".into(),
                "\0\0\0\0\0\0".into(),
            ],
        );

        assert_eq!(records.len(), 1);
        // Progress stops at the last emitted record, not the NUL run.
        assert_eq!(context.position, records[0].position);
    }

    #[test]
    fn record_pattern_drops_non_matching_lines() {
        let parser = DelimitedParser::new(DelimitedParserOptions {
            delimiter: ",".into(),
            headers: Some(vec!["a".into(), "b".into()]),
            record_pattern: Some(r"^\d".into()),
            ..Default::default()
        })
        .unwrap();
        let (records, _) = parse_all(
            &parser,
            vec!["1,one".into(), "continuation text".into(), "2,two".into()],
        );

        assert_eq!(records.len(), 2);
        assert_eq!(field(&records[1], "a"), "2");
    }

    #[test]
    fn exchange_preset_parses_quoted_csv() {
        let parser = DelimitedParser::exchange();
        let (records, _) = parse_all(
            &parser,
            vec![
                "#Fields: date-time,client-ip,recipient-address".into(),
                r#"2024-03-01T12:00:00.000Z,10.0.0.5,"a@example.com;b@example.com""#.into(),
            ],
        );

        assert_eq!(records.len(), 1);
        assert_eq!(
            field(&records[0], "recipient-address"),
            "a@example.com;b@example.com"
        );
        assert_eq!(
            records[0].timestamp.unwrap().to_rfc3339(),
            "2024-03-01T12:00:00+00:00"
        );
    }
}
