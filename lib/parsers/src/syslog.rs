use std::io;

use chrono::{DateTime, Datelike, Utc};
use metrics::counter;
use syslog_loose::{IncompleteDate, Variant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{LineSource, ParseContext, ParsedRecord, RecordParser};

/// RFC 3164 and RFC 5424 (ISO-8601 timestamped) syslog lines. The
/// canonical envelope timestamp is always UTC; RFC 3164 dates carry no
/// year, so one is filled in relative to the current date.
#[derive(Debug, Default)]
pub struct SyslogParser;

/// Resolve the year for syslog messages that don't include one.
///
/// If the current month is January and the message is from December, the
/// message is from the year that just ended.
fn resolve_year((month, _date, _hour, _min, _sec): IncompleteDate) -> i32 {
    let now = Utc::now();
    if now.month() == 1 && month == 12 {
        now.year() - 1
    } else {
        now.year()
    }
}

impl RecordParser for SyslogParser {
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

            let parsed = match syslog_loose::parse_message_with_year_exact(
                text,
                resolve_year,
                Variant::Either,
            ) {
                Ok(message) => message,
                Err(error) => {
                    warn!(
                        message = "Dropping unparseable syslog line.",
                        line_number = line.line_number,
                        %error,
                    );
                    counter!("parser_records_discarded_total").increment(1);
                    continue;
                }
            };

            let mut fields = serde_json::Map::new();
            if let Some(hostname) = parsed.hostname {
                fields.insert("hostname".into(), hostname.into());
            }
            if let Some(program) = parsed.appname {
                fields.insert("program".into(), program.into());
            }
            if let Some(severity) = parsed.severity {
                fields.insert("severity".into(), severity.as_str().into());
            }
            if let Some(facility) = parsed.facility {
                fields.insert("facility".into(), facility.as_str().into());
            }
            fields.insert("message".into(), parsed.msg.into());

            let timestamp = parsed.timestamp.map(DateTime::<Utc>::from);
            if let Some(timestamp) = timestamp {
                fields.insert("syslog_timestamp".into(), timestamp.to_rfc3339().into());
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::VecLineSource;

    fn parse_all(lines: Vec<String>) -> Vec<ParsedRecord> {
        let mut source = VecLineSource::new(lines);
        let mut context = ParseContext::default();
        let mut out = Vec::new();
        SyslogParser
            .parse_records(
                &mut context,
                &mut source,
                &mut out,
                usize::MAX,
                &CancellationToken::new(),
            )
            .unwrap();
        out
    }

    #[test]
    fn rfc3164_line_fills_current_year() {
        let records = parse_all(vec![
            "<34>Mar  1 12:00:00 web01 sshd[123]: Accepted publickey for deploy".into(),
        ]);

        assert_eq!(records.len(), 1);
        let fields = records[0].fields.as_ref().unwrap();
        assert_eq!(fields["hostname"], "web01");
        assert_eq!(fields["program"], "sshd");
        assert_eq!(fields["message"], "Accepted publickey for deploy");
        // A March date never triggers the December-in-January rollback.
        assert_eq!(records[0].timestamp.unwrap().year(), Utc::now().year());
    }

    #[test]
    fn rfc5424_line_converts_to_utc() {
        let records = parse_all(vec![
            "<165>1 2024-03-01T10:00:00.000+02:00 host01 app 4711 MSGID - an event".into(),
        ]);

        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].timestamp.unwrap().to_rfc3339(),
            "2024-03-01T08:00:00+00:00"
        );
        let fields = records[0].fields.as_ref().unwrap();
        assert_eq!(fields["program"], "app");
        assert_eq!(fields["syslog_timestamp"], "2024-03-01T08:00:00+00:00");
    }
}
