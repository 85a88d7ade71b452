use std::io;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    timestamp::{parse_timestamp, TimeZoneKind, EPOCH_FORMAT},
    LineSource, ParseContext, ParsedRecord, ParserConfigError, RecordParser,
};

#[derive(Debug, Default)]
pub struct JsonLineParserOptions {
    /// Dotted path to the timestamp within each object, e.g.
    /// `"metadata.time"`.
    pub timestamp_field: Option<String>,
    /// Chrono format string, or `"epoch"` for Unix milliseconds. Required
    /// when `timestamp_field` is set.
    pub timestamp_format: Option<String>,
    pub time_zone: TimeZoneKind,
}

/// One JSON object per line. Lines that do not parse are dropped with a
/// warning; the stream keeps going.
pub struct JsonLineParser {
    timestamp_path: Option<Vec<String>>,
    timestamp_format: Option<String>,
    time_zone: TimeZoneKind,
}

impl JsonLineParser {
    pub fn new(options: JsonLineParserOptions) -> Result<Self, ParserConfigError> {
        if options.timestamp_field.is_some() && options.timestamp_format.is_none() {
            return Err(ParserConfigError::TimestampFieldWithoutFormat);
        }
        Ok(Self {
            timestamp_path: options
                .timestamp_field
                .map(|field| field.split('.').map(str::to_owned).collect()),
            timestamp_format: options.timestamp_format,
            time_zone: options.time_zone,
        })
    }

    fn timestamp_of(&self, value: &serde_json::Value) -> Option<chrono::DateTime<chrono::Utc>> {
        let path = self.timestamp_path.as_ref()?;
        let format = self.timestamp_format.as_deref()?;

        let mut cursor = value;
        for segment in path {
            cursor = cursor.get(segment)?;
        }

        match cursor {
            serde_json::Value::String(raw) => parse_timestamp(raw, format, self.time_zone),
            serde_json::Value::Number(number) if format == EPOCH_FORMAT => {
                chrono::DateTime::from_timestamp_millis(number.as_i64()?)
            }
            _ => None,
        }
    }
}

impl RecordParser for JsonLineParser {
    fn parse_records(
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
            let text = line.text.trim();
            if text.is_empty() {
                continue;
            }

            let value: serde_json::Value = match serde_json::from_str(text) {
                Ok(value) => value,
                Err(error) => {
                    warn!(
                        message = "Dropping line that is not valid JSON.",
                        line_number = line.line_number,
                        %error,
                    );
                    counter!("parser_records_discarded_total").increment(1);
                    continue;
                }
            };

            let timestamp = self.timestamp_of(&value);
            let fields = match value {
                serde_json::Value::Object(map) => Some(map),
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("value".to_owned(), other);
                    Some(map)
                }
            };

            let record = ParsedRecord {
                text: text.to_owned(),
                timestamp,
                fields,
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
