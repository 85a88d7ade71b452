use std::{
    fs::File,
    io::{self, Seek, SeekFrom},
    path::PathBuf,
    time::Instant,
};

use tracing::debug;

use crate::{
    line_reader::{Encoding, LineReader},
    metadata_ext::PortableFileExt,
    FilePosition, ReadFrom,
};

/// One decoded line from a watched file, carrying the state a caller
/// needs to build an envelope and persist progress.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub text: String,
    /// Byte offset just past this line's terminator; resuming from here
    /// re-reads nothing and skips nothing.
    pub position: FilePosition,
    /// 1-based line number within the file.
    pub line_number: u64,
}

/// The per-file tailing state machine.
///
/// A `FileWatcher` tracks exactly one file identity. Renames within the
/// watched tree do not disturb it (the caller updates `path` when the
/// identity shows up under a new name); the caller is responsible for
/// retiring watchers whose files are gone.
pub struct FileWatcher {
    pub path: PathBuf,
    reader: LineReader<File>,
    base_offset: FilePosition,
    devno: u64,
    inode: u64,
    findable: bool,
    is_dead: bool,
    reached_eof: bool,
    last_seen: Instant,
    line_number: u64,
}

impl FileWatcher {
    /// Open `path` and position the reader according to `read_from`.
    ///
    /// `encoding` is the cached per-file encoding when known; it must be
    /// supplied when resuming from a checkpoint, since a byte-order mark
    /// can only be sniffed at offset zero. `start_line_number` carries the
    /// restored line count for checkpoint resumes.
    pub fn new(
        path: PathBuf,
        read_from: ReadFrom,
        encoding: Option<Encoding>,
        start_line_number: u64,
        max_line_bytes: usize,
    ) -> io::Result<FileWatcher> {
        let mut file = File::open(&path)?;
        let (devno, inode) = (file.portable_dev()?, file.portable_ino()?);

        let base_offset = match read_from {
            ReadFrom::Beginning => 0,
            ReadFrom::End => file.seek(SeekFrom::End(0))?,
            ReadFrom::Checkpoint(position) => file.seek(SeekFrom::Start(position))?,
        };

        let reader = if base_offset == 0 {
            LineReader::new(file, encoding)
        } else {
            // Mid-file: no BOM to sniff, so an encoding must be assumed.
            LineReader::resume(file, encoding.unwrap_or(Encoding::Utf8))
        };

        Ok(FileWatcher {
            path,
            reader: reader.with_max_line_bytes(max_line_bytes),
            base_offset,
            devno,
            inode,
            findable: true,
            is_dead: false,
            reached_eof: false,
            last_seen: Instant::now(),
            line_number: start_line_number,
        })
    }

    pub fn devno_inode(&self) -> (u64, u64) {
        (self.devno, self.inode)
    }

    /// Byte offset of the next unread data, safe to persist as a resume
    /// point.
    pub fn position(&self) -> FilePosition {
        self.base_offset + self.reader.bytes_consumed()
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.reader.encoding()
    }

    pub fn set_file_findable(&mut self, findable: bool) {
        self.findable = findable;
        if findable {
            self.last_seen = Instant::now();
        }
    }

    pub fn file_findable(&self) -> bool {
        self.findable
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn set_dead(&mut self) {
        self.is_dead = true;
    }

    pub fn dead(&self) -> bool {
        self.is_dead
    }

    pub fn reached_eof(&self) -> bool {
        self.reached_eof
    }

    /// Record that this identity now lives at a different path (rotation
    /// rename); the open descriptor keeps reading the same file.
    pub fn update_path(&mut self, path: PathBuf) {
        debug!(
            message = "Watched file renamed.",
            old_path = %self.path.display(),
            new_path = %path.display(),
        );
        self.path = path;
    }

    /// Read the next complete line, if one is available.
    ///
    /// Returns `Ok(None)` at (current) end of file. When the file has been
    /// deleted out from under us, whatever bytes remain buffered are
    /// committed as a final line and the watcher marks itself dead.
    pub fn read_line(&mut self) -> io::Result<Option<LogLine>> {
        match self.reader.read_line() {
            Ok((Some(text), consumed)) => {
                self.reached_eof = false;
                self.line_number += 1;
                Ok(Some(LogLine {
                    text,
                    position: self.base_offset + consumed,
                    line_number: self.line_number,
                }))
            }
            Ok((None, _)) => {
                if !self.findable {
                    self.set_dead();
                    // The file is gone; flush the sheared tail rather than
                    // wait for a newline that can never arrive.
                    let (line, consumed) = self.reader.flush();
                    if let Some(text) = line {
                        self.line_number += 1;
                        return Ok(Some(LogLine {
                            text,
                            position: self.base_offset + consumed,
                            line_number: self.line_number,
                        }));
                    }
                }
                self.reached_eof = true;
                Ok(None)
            }
            Err(error) => {
                if error.kind() == io::ErrorKind::NotFound {
                    self.set_dead();
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    fn watch(path: PathBuf, read_from: ReadFrom) -> FileWatcher {
        FileWatcher::new(path, read_from, None, 0, 102_400).unwrap()
    }

    #[test]
    fn reads_lines_and_tracks_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let mut watcher = watch(path, ReadFrom::Beginning);

        let line = watcher.read_line().unwrap().unwrap();
        assert_eq!(line.text, "first");
        assert_eq!(line.position, 6);
        assert_eq!(line.line_number, 1);

        let line = watcher.read_line().unwrap().unwrap();
        assert_eq!(line.text, "second");
        assert_eq!(line.position, 13);
        assert_eq!(line.line_number, 2);

        assert!(watcher.read_line().unwrap().is_none());
        assert!(watcher.reached_eof());
        assert_eq!(watcher.position(), 13);
    }

    #[test]
    fn sees_appends_after_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\n").unwrap();

        let mut watcher = watch(path.clone(), ReadFrom::Beginning);
        assert_eq!(watcher.read_line().unwrap().unwrap().text, "one");
        assert!(watcher.read_line().unwrap().is_none());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"two\n").unwrap();

        assert_eq!(watcher.read_line().unwrap().unwrap().text, "two");
    }

    #[test]
    fn read_from_end_skips_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old\n").unwrap();

        let mut watcher = watch(path.clone(), ReadFrom::End);
        assert!(watcher.read_line().unwrap().is_none());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"new\n").unwrap();

        let line = watcher.read_line().unwrap().unwrap();
        assert_eq!(line.text, "new");
        assert_eq!(line.position, 8);
    }

    #[test]
    fn checkpoint_resume_continues_mid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let mut watcher = FileWatcher::new(
            path,
            ReadFrom::Checkpoint(6),
            Some(Encoding::Utf8),
            1,
            102_400,
        )
        .unwrap();

        let line = watcher.read_line().unwrap().unwrap();
        assert_eq!(line.text, "second");
        assert_eq!(line.line_number, 2);
        assert_eq!(line.position, 13);
    }

    #[cfg(unix)]
    #[test]
    fn keeps_reading_renamed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "before\n").unwrap();

        let mut watcher = watch(path, ReadFrom::Beginning);
        assert_eq!(watcher.read_line().unwrap().unwrap().text, "before");

        let rotated = dir.path().join("app.log.1");
        std::fs::rename(dir.path().join("app.log"), &rotated).unwrap();
        watcher.update_path(rotated.clone());

        let mut file = std::fs::OpenOptions::new().append(true).open(&rotated).unwrap();
        file.write_all(b"after\n").unwrap();

        let line = watcher.read_line().unwrap().unwrap();
        assert_eq!(line.text, "after");
        assert_eq!(watcher.path, rotated);
    }

    #[cfg(unix)]
    #[test]
    fn deleted_file_flushes_partial_line_and_dies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "done\nsheared tail").unwrap();

        let mut watcher = watch(path.clone(), ReadFrom::Beginning);
        assert_eq!(watcher.read_line().unwrap().unwrap().text, "done");

        std::fs::remove_file(&path).unwrap();
        watcher.set_file_findable(false);

        let line = watcher.read_line().unwrap().unwrap();
        assert_eq!(line.text, "sheared tail");
        assert!(watcher.dead());
        assert!(watcher.read_line().unwrap().is_none());
    }
}
