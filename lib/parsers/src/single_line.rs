use std::io;

use tokio_util::sync::CancellationToken;

use crate::{LineSource, ParseContext, ParsedRecord, RecordParser};

/// One line, one record. Timestamps are left to ingestion time.
#[derive(Debug, Default)]
pub struct SingleLineParser;

impl RecordParser for SingleLineParser {
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
            let record = ParsedRecord {
                text: line.text,
                timestamp: None,
                fields: None,
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
