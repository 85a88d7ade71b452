use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// The payload every source in this crate emits: the raw record text plus
/// whatever structured fields its parser extracted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogRecord {
    pub text: String,
    pub fields: Option<Map<String, Value>>,
}

impl From<logtap_parsers::ParsedRecord> for LogRecord {
    fn from(record: logtap_parsers::ParsedRecord) -> Self {
        Self {
            text: record.text,
            fields: record.fields,
        }
    }
}

/// Output renderings a sink may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeFormat {
    /// The raw record text.
    #[default]
    Plain,
    /// A JSON object of the record fields plus the envelope timestamp.
    Json,
    /// An `<Event>` element with one child element per field.
    Xml,
    /// An `<Event>` element with one attribute per field.
    Xml2,
}

/// A record plus its ingestion metadata, immutable once built.
///
/// The timestamp is the record's own time when the parser recovered one,
/// otherwise the time of ingestion. `bookmark_key` and `position` tie the
/// envelope back to its source's progress tracking; a sink passes them to
/// the bookmark manager after a successful send.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    data: T,
    timestamp: DateTime<Utc>,
    position: Option<i64>,
    bookmark_key: Option<String>,
    source_path: Option<PathBuf>,
    line_number: Option<u64>,
}

impl<T> Envelope<T> {
    pub fn new(data: T, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            data,
            timestamp: timestamp.unwrap_or_else(Utc::now),
            position: None,
            bookmark_key: None,
            source_path: None,
            line_number: None,
        }
    }

    pub fn with_bookmark(mut self, key: String, position: i64) -> Self {
        self.bookmark_key = Some(key);
        self.position = Some(position);
        self
    }

    pub fn with_source_path(mut self, path: PathBuf) -> Self {
        self.source_path = Some(path);
        self
    }

    pub fn with_line_number(mut self, line_number: u64) -> Self {
        self.line_number = Some(line_number);
        self
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn position(&self) -> Option<i64> {
        self.position
    }

    pub fn bookmark_key(&self) -> Option<&str> {
        self.bookmark_key.as_deref()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn line_number(&self) -> Option<u64> {
        self.line_number
    }
}

impl Envelope<LogRecord> {
    /// Render the record for an outbound request.
    pub fn formatted(&self, format: EnvelopeFormat) -> String {
        match format {
            EnvelopeFormat::Plain => self.data.text.clone(),
            EnvelopeFormat::Json => {
                let mut object = self.data.fields.clone().unwrap_or_else(|| {
                    let mut map = Map::new();
                    map.insert("message".into(), Value::String(self.data.text.clone()));
                    map
                });
                object.insert(
                    "timestamp".into(),
                    Value::String(self.timestamp.to_rfc3339()),
                );
                Value::Object(object).to_string()
            }
            EnvelopeFormat::Xml => {
                let mut out = String::from("<Event>");
                out.push_str(&format!(
                    "<Timestamp>{}</Timestamp>",
                    self.timestamp.to_rfc3339()
                ));
                match &self.data.fields {
                    Some(fields) => {
                        for (name, value) in fields {
                            out.push_str(&format!(
                                "<Field Name=\"{}\">{}</Field>",
                                xml_escape(name),
                                xml_escape(&value_text(value)),
                            ));
                        }
                    }
                    None => {
                        out.push_str(&format!(
                            "<Message>{}</Message>",
                            xml_escape(&self.data.text)
                        ));
                    }
                }
                out.push_str("</Event>");
                out
            }
            EnvelopeFormat::Xml2 => {
                let mut out = String::from("<Event");
                out.push_str(&format!(
                    " Timestamp=\"{}\"",
                    self.timestamp.to_rfc3339()
                ));
                if let Some(fields) = &self.data.fields {
                    for (name, value) in fields {
                        out.push_str(&format!(
                            " {}=\"{}\"",
                            xml_attribute_name(name),
                            xml_escape(&value_text(value)),
                        ));
                    }
                } else {
                    out.push_str(&format!(
                        " Message=\"{}\"",
                        xml_escape(&self.data.text)
                    ));
                }
                out.push_str("/>");
                out
            }
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn xml_escape(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            '&' => "&amp;".to_owned(),
            '<' => "&lt;".to_owned(),
            '>' => "&gt;".to_owned(),
            '"' => "&quot;".to_owned(),
            '\'' => "&apos;".to_owned(),
            other => other.to_string(),
        })
        .collect()
}

/// XML attribute names cannot contain most punctuation that shows up in
/// log field names (`cs-method`, `date-time`); map offenders to `_`.
fn xml_attribute_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out
        .chars()
        .next()
        .map(|ch| ch.is_ascii_digit() || ch == '-' || ch == '.')
        .unwrap_or(true)
    {
        out.insert(0, '_');
    }
    out
}
