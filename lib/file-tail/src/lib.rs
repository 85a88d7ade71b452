//! Tailing primitives for append-only text files: encoding-aware line
//! reading, stable file identity across renames, and the per-file watcher
//! state machine the directory source schedules reads over.

#![deny(clippy::all)]

pub mod fingerprinter;
pub mod line_reader;
mod metadata_ext;
pub mod watcher;

pub use self::fingerprinter::{FileFingerprint, Fingerprinter, FingerprintStrategy};
pub use self::line_reader::{count_lines, Encoding, LineReader};
pub use self::metadata_ext::PortableFileExt;
pub use self::watcher::{FileWatcher, LogLine};

pub type FilePosition = u64;

/// Where a watcher starts reading a file it has no recorded progress for.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum ReadFrom {
    #[default]
    Beginning,
    End,
    Checkpoint(FilePosition),
}
