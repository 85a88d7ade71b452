use std::io::{self, Read};

use bstr::ByteSlice;
use tracing::warn;

const INITIAL_CAPACITY: usize = 1024;

const LF: u32 = 0x0A;
const CR: u32 = 0x0D;

/// Text encodings the reader can detect from a byte-order mark. Everything
/// without a BOM is treated as UTF-8.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
}

impl Encoding {
    /// Width in bytes of one code unit.
    pub const fn unit_len(self) -> usize {
        match self {
            Encoding::Utf8 => 1,
            Encoding::Utf16Le | Encoding::Utf16Be => 2,
            Encoding::Utf32Le | Encoding::Utf32Be => 4,
        }
    }

    /// Stable name used when caching a detected encoding in a bookmark.
    pub const fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Utf16Le => "utf-16le",
            Encoding::Utf16Be => "utf-16be",
            Encoding::Utf32Le => "utf-32le",
            Encoding::Utf32Be => "utf-32be",
        }
    }

    pub fn from_name(name: &str) -> Option<Encoding> {
        match name {
            "utf-8" => Some(Encoding::Utf8),
            "utf-16le" => Some(Encoding::Utf16Le),
            "utf-16be" => Some(Encoding::Utf16Be),
            "utf-32le" => Some(Encoding::Utf32Le),
            "utf-32be" => Some(Encoding::Utf32Be),
            _ => None,
        }
    }

    const fn bom(self) -> &'static [u8] {
        match self {
            Encoding::Utf8 => &[0xEF, 0xBB, 0xBF],
            Encoding::Utf16Le => &[0xFF, 0xFE],
            Encoding::Utf16Be => &[0xFE, 0xFF],
            Encoding::Utf32Le => &[0xFF, 0xFE, 0x00, 0x00],
            Encoding::Utf32Be => &[0x00, 0x00, 0xFE, 0xFF],
        }
    }

    /// Match a BOM against the start of `prefix`. The UTF-32 patterns are
    /// checked before their UTF-16 prefixes, so callers must not decide on
    /// fewer than four bytes unless the stream has ended.
    fn detect(prefix: &[u8]) -> Option<(Encoding, usize)> {
        for encoding in [
            Encoding::Utf32Be,
            Encoding::Utf32Le,
            Encoding::Utf8,
            Encoding::Utf16Be,
            Encoding::Utf16Le,
        ] {
            let bom = encoding.bom();
            if prefix.starts_with(bom) {
                return Some((encoding, bom.len()));
            }
        }
        None
    }

    /// Whether `prefix` could still become a BOM once more bytes arrive.
    fn ambiguous(prefix: &[u8]) -> bool {
        [
            Encoding::Utf32Be,
            Encoding::Utf32Le,
            Encoding::Utf8,
            Encoding::Utf16Be,
            Encoding::Utf16Le,
        ]
        .iter()
        .any(|encoding| {
            let bom = encoding.bom();
            bom.len() > prefix.len() && bom.starts_with(prefix)
        })
    }

    /// Read the code unit starting at `bytes` (which must hold at least
    /// `unit_len` bytes).
    fn unit_at(self, bytes: &[u8]) -> u32 {
        match self {
            Encoding::Utf8 => u32::from(bytes[0]),
            Encoding::Utf16Le => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            Encoding::Utf16Be => u32::from(u16::from_be_bytes([bytes[0], bytes[1]])),
            Encoding::Utf32Le => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Encoding::Utf32Be => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Decode `bytes` to a string, replacing malformed sequences rather
    /// than failing: log tails are routinely sheared mid-character.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Utf16Le => encoding_rs::UTF_16LE
                .decode_without_bom_handling(bytes)
                .0
                .into_owned(),
            Encoding::Utf16Be => encoding_rs::UTF_16BE
                .decode_without_bom_handling(bytes)
                .0
                .into_owned(),
            Encoding::Utf32Le | Encoding::Utf32Be => bytes
                .chunks_exact(4)
                .map(|chunk| {
                    let value = self.unit_at(chunk);
                    char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER)
                })
                .collect(),
        }
    }
}

enum Scan {
    /// Line spanning `line_len` bytes from `pos`, terminated by
    /// `terminator_len` bytes.
    Line {
        line_len: usize,
        terminator_len: usize,
    },
    NeedMore,
}

/// An incremental, encoding-detecting line reader over an append-only byte
/// stream.
///
/// `read_line` returns `(Option<String>, bytes_consumed)`. `None` means no
/// complete line is buffered yet; the consumed count is absolute since
/// construction and only ever covers fully-committed lines (plus a BOM),
/// so it is always safe to persist as a resume offset.
///
/// Line terminators are `\n`, `\r\n`, or a bare `\r`. Exactly one
/// terminator is consumed per line; a `\r` at the end of the buffer is
/// held back until the next byte shows whether it heads a `\r\n` pair.
pub struct LineReader<R> {
    reader: R,
    encoding: Option<Encoding>,
    explicit: bool,
    bom_checked: bool,
    buf: Vec<u8>,
    pos: usize,
    /// Offset relative to `pos` already scanned without finding a
    /// terminator, so appended data does not trigger rescans.
    scanned: usize,
    committed: u64,
    max_line_bytes: usize,
    discarding: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(reader: R, encoding: Option<Encoding>) -> Self {
        Self {
            reader,
            encoding,
            explicit: encoding.is_some(),
            bom_checked: false,
            buf: Vec::with_capacity(INITIAL_CAPACITY),
            pos: 0,
            scanned: 0,
            committed: 0,
            max_line_bytes: usize::MAX,
            discarding: false,
        }
    }

    /// A reader positioned mid-stream, e.g. resuming a tailed file from a
    /// persisted offset. The encoding is taken as given and no byte-order
    /// mark is expected.
    pub fn resume(reader: R, encoding: Encoding) -> Self {
        let mut this = Self::new(reader, Some(encoding));
        this.bom_checked = true;
        this
    }

    /// Cap the bytes a single line may occupy; oversized lines are
    /// discarded with a warning instead of growing the buffer forever.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    /// Total bytes consumed from the stream, counting only committed
    /// lines and the byte-order mark.
    pub fn bytes_consumed(&self) -> u64 {
        self.committed
    }

    /// The encoding in effect, once detected from the stream or supplied
    /// up front.
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Try to produce the next complete line.
    pub fn read_line(&mut self) -> io::Result<(Option<String>, u64)> {
        loop {
            if self.bom_checked {
                match self.scan() {
                    Scan::Line {
                        line_len,
                        terminator_len,
                    } => {
                        if let Some(line) = self.commit(line_len, terminator_len) {
                            return Ok((Some(line), self.committed));
                        }
                        // A discarded oversized line; keep scanning.
                        continue;
                    }
                    Scan::NeedMore => {}
                }
            }

            if self.fill()? == 0 {
                return Ok((None, self.committed));
            }

            if !self.bom_checked {
                self.check_bom(false);
            }
        }
    }

    /// Commit whatever remains buffered as a final line. Called when the
    /// stream has genuinely ended (file deleted, source stopping) and no
    /// further bytes can complete a terminator.
    pub fn flush(&mut self) -> (Option<String>, u64) {
        if !self.bom_checked {
            self.check_bom(true);
        }

        let encoding = self.encoding.unwrap_or(Encoding::Utf8);
        let pending = self.buf.len() - self.pos;
        if pending == 0 {
            return (None, self.committed);
        }

        // A trailing lone `\r` is a terminator now that no `\n` can follow.
        let unit = encoding.unit_len();
        let usable = pending - pending % unit;
        let data = &self.buf[self.pos..self.pos + usable];
        let line_bytes = if usable >= unit
            && encoding.unit_at(&data[usable - unit..]) == CR
        {
            &data[..usable - unit]
        } else {
            data
        };

        let line = encoding.decode(line_bytes);
        self.pos = self.buf.len();
        self.scanned = 0;
        self.committed += pending as u64;

        if self.discarding || line_bytes.len() > self.max_line_bytes {
            self.discarding = false;
            return (None, self.committed);
        }
        (Some(line), self.committed)
    }

    fn scan(&mut self) -> Scan {
        let encoding = self.encoding.unwrap_or(Encoding::Utf8);
        let unit = encoding.unit_len();
        let data = &self.buf[self.pos..];
        let usable = data.len() - data.len() % unit;

        let mut i = self.scanned;
        while i + unit <= usable {
            // Single-byte encodings get a vectorized scan to the next
            // candidate terminator instead of the unit-by-unit walk.
            if unit == 1 {
                match data[i..usable].find_byteset(b"\r\n") {
                    Some(offset) => i += offset,
                    None => {
                        i = usable;
                        break;
                    }
                }
            }
            let value = encoding.unit_at(&data[i..]);
            if value == LF {
                self.scanned = 0;
                return Scan::Line {
                    line_len: i,
                    terminator_len: unit,
                };
            }
            if value == CR {
                if i + 2 * unit > usable {
                    // The pair might be split across this buffer boundary;
                    // hold the `\r` back until its successor arrives.
                    self.scanned = i;
                    return Scan::NeedMore;
                }
                let terminator_len = if encoding.unit_at(&data[i + unit..]) == LF {
                    2 * unit
                } else {
                    unit
                };
                self.scanned = 0;
                return Scan::Line {
                    line_len: i,
                    terminator_len,
                };
            }
            i += unit;
        }

        self.scanned = i;
        if !self.discarding && i > self.max_line_bytes {
            warn!(
                message = "Found line that exceeds max_line_bytes; discarding.",
                buffered = i,
                max_line_bytes = self.max_line_bytes,
            );
            self.discarding = true;
        }
        Scan::NeedMore
    }

    /// Consume one scanned line from the buffer, returning it unless it
    /// was being discarded for size.
    fn commit(&mut self, line_len: usize, terminator_len: usize) -> Option<String> {
        let encoding = self.encoding.unwrap_or(Encoding::Utf8);
        let total = line_len + terminator_len;
        let line = if self.discarding || line_len > self.max_line_bytes {
            self.discarding = false;
            None
        } else {
            Some(encoding.decode(&self.buf[self.pos..self.pos + line_len]))
        };

        self.pos += total;
        self.committed += total as u64;
        line
    }

    fn check_bom(&mut self, at_eof: bool) {
        let prefix = &self.buf[self.pos..];

        if self.explicit {
            let bom = self.encoding.expect("explicit encoding set").bom();
            if prefix.starts_with(bom) {
                self.consume_bom(bom.len());
                self.bom_checked = true;
            } else if at_eof || !bom.starts_with(&prefix[..prefix.len().min(bom.len())]) {
                self.bom_checked = true;
            }
            return;
        }

        match Encoding::detect(prefix) {
            Some((encoding, bom_len)) => {
                // `FF FE` is both the UTF-16 LE BOM and a prefix of the
                // UTF-32 LE one; wait for the distinguishing bytes.
                if !at_eof && Encoding::ambiguous(prefix) && prefix.len() < 4 {
                    return;
                }
                self.encoding = Some(encoding);
                self.consume_bom(bom_len);
                self.bom_checked = true;
            }
            None => {
                if at_eof || !Encoding::ambiguous(prefix) {
                    self.encoding = Some(Encoding::Utf8);
                    self.bom_checked = true;
                }
            }
        }
    }

    fn consume_bom(&mut self, bom_len: usize) {
        self.pos += bom_len;
        self.committed += bom_len as u64;
    }

    fn fill(&mut self) -> io::Result<usize> {
        if self.pos > 0 && self.pos >= self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        if self.buf.len() == self.buf.capacity() {
            self.buf.reserve(self.buf.capacity().max(INITIAL_CAPACITY));
        }

        let old_len = self.buf.len();
        self.buf.resize(self.buf.capacity(), 0);
        let read = loop {
            match self.reader.read(&mut self.buf[old_len..]) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e);
                }
            }
        };
        self.buf.truncate(old_len + read);
        Ok(read)
    }
}

/// Count the lines ending within the first `up_to` bytes of `reader`, so
/// a line number can be restored from a persisted byte offset.
pub fn count_lines(
    mut reader: impl Read,
    encoding: Encoding,
    up_to: u64,
) -> io::Result<u64> {
    let unit = encoding.unit_len();
    let mut remaining = up_to as usize;
    let mut lines = 0u64;
    let mut prev_was_cr = false;
    let mut chunk = vec![0u8; 8192 - 8192 % unit];

    while remaining >= unit {
        let want = chunk.len().min(remaining - remaining % unit);
        let read = reader.read(&mut chunk[..want])?;
        if read == 0 {
            break;
        }
        remaining -= read;

        for bytes in chunk[..read - read % unit].chunks_exact(unit) {
            let value = encoding.unit_at(bytes);
            if value == LF {
                if !prev_was_cr {
                    lines += 1;
                }
                prev_was_cr = false;
            } else {
                if prev_was_cr {
                    lines += 1;
                }
                prev_was_cr = value == CR;
            }
        }
    }
    if prev_was_cr {
        lines += 1;
    }
    Ok(lines)
}
