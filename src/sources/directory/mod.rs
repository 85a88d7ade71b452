//! A source that polls a directory for files matching a set of glob
//! patterns, tails each one through rotation, parses records, and resumes
//! from per-file bookmarks after a restart.
//!
//! Files are keyed by a stable fingerprint (device and inode by default),
//! so a rename inside the watched tree continues the same read. When a
//! rotated file's name stops matching the filters, its reader finishes
//! the data already visible and retires at end of file.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use file_tail::{
    count_lines, Encoding, FileFingerprint, FileWatcher, Fingerprinter, FingerprintStrategy,
    ReadFrom,
};
use logtap_parsers::{ParseContext, ParsedRecord, RecordParser};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{InitialPosition, SourceConfigError};
use crate::{
    bookmarks::BookmarkManager,
    event::{Envelope, LogRecord},
};

const ARCHIVE_EXTENSIONS: [&str; 4] = ["zip", "gz", "tar", "bz2"];
const MAX_RECORDS_PER_PASS: usize = 1000;
const MAX_IDLE_BACKOFF_MS: u64 = 2048;
const UNAVAILABLE_WARN_AFTER: Duration = Duration::from_secs(3600);

fn default_query_period_ms() -> u64 {
    100
}

fn default_max_line_bytes() -> usize {
    102_400
}

fn default_dependency_poll_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySourceConfig {
    /// Source id; names the bookmark file and tags every envelope.
    pub id: String,

    /// The watched directory.
    pub directory: PathBuf,

    /// Glob patterns relative to `directory`, e.g. `["*.log"]`.
    pub name_filters: Vec<String>,

    #[serde(default)]
    pub include_subdirectories: bool,

    /// Substring filter on the parent path of matched files. `/` and `\`
    /// are interchangeable.
    #[serde(default)]
    pub include_directory_filter: Option<String>,

    /// Poll period for discovery and tailing.
    #[serde(default = "default_query_period_ms")]
    pub query_period_ms: u64,

    #[serde(default)]
    pub initial_position: InitialPosition,

    #[serde(default)]
    pub initial_position_timestamp: Option<DateTime<Utc>>,

    /// When true, bookmarks advance on sink acknowledgment; when false,
    /// the source persists progress as it emits.
    #[serde(default)]
    pub bookmark_on_buffer_flush: bool,

    /// Force an encoding instead of per-file BOM detection.
    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// How often to probe for the directory while it is missing.
    #[serde(default = "default_dependency_poll_ms")]
    pub dependency_poll_ms: u64,
}

/// Per-file bookmark payload persisted for this source.
#[derive(Debug, Serialize, Deserialize)]
struct FileBookmark {
    fingerprint: FileFingerprint,
    position: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encoding: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileBookmarkSet {
    files: Vec<FileBookmark>,
}

/// Metadata the bookmark renderer needs beyond the acked position.
struct SubMeta {
    fingerprint: FileFingerprint,
    encoding: Option<String>,
}

struct FileEntry {
    watcher: FileWatcher,
    context: ParseContext,
    sub_key: String,
}

pub struct DirectorySource {
    config: DirectorySourceConfig,
    parser: Box<dyn RecordParser>,
    fingerprinter: Fingerprinter,
    bookmarks: Arc<BookmarkManager>,
    /// Shared with the bookmark renderer registered on the manager.
    sub_meta: Arc<DashMap<String, SubMeta>>,
    forced_encoding: Option<Encoding>,
    /// Saved positions loaded at startup, consulted when a known file is
    /// rediscovered.
    saved: HashMap<FileFingerprint, FileBookmark>,
}

impl DirectorySource {
    pub fn new(
        config: DirectorySourceConfig,
        parser: Box<dyn RecordParser>,
        bookmarks: Arc<BookmarkManager>,
    ) -> Result<Self, SourceConfigError> {
        ensure!(!config.id.is_empty(), super::EmptyIdSnafu);
        ensure!(!config.name_filters.is_empty(), super::NoNameFiltersSnafu);
        ensure!(
            config.initial_position != InitialPosition::Timestamp
                || config.initial_position_timestamp.is_some(),
            super::MissingInitialTimestampSnafu
        );

        let forced_encoding = config
            .encoding
            .as_deref()
            .and_then(Encoding::from_name);

        Ok(Self {
            config,
            parser,
            fingerprinter: Fingerprinter::new(FingerprintStrategy::DevInode),
            bookmarks,
            sub_meta: Arc::new(DashMap::new()),
            forced_encoding,
            saved: HashMap::new(),
        })
    }

    /// Drive discovery and tailing until cancelled. Envelopes flow into
    /// `output`; a full channel backpressures the reads.
    pub async fn run(
        mut self,
        output: mpsc::Sender<Envelope<LogRecord>>,
        cancel: CancellationToken,
    ) {
        info!(
            message = "Directory source starting.",
            source_id = self.config.id.as_str(),
            directory = %self.config.directory.display(),
        );

        self.restore_bookmarks();

        let mut entries: HashMap<FileFingerprint, FileEntry> = HashMap::new();
        let mut idle_backoff_ms = self.config.query_period_ms;
        let mut unavailable_since: Option<Instant> = None;
        let mut unavailable_warned = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !self.config.directory.is_dir() {
                if unavailable_since.is_none() {
                    warn!(
                        message = "Watched directory is unavailable; discarding file state and polling.",
                        directory = %self.config.directory.display(),
                    );
                    entries.clear();
                    unavailable_since = Some(Instant::now());
                    unavailable_warned = false;
                } else if !unavailable_warned
                    && unavailable_since
                        .map(|since| since.elapsed() >= UNAVAILABLE_WARN_AFTER)
                        .unwrap_or(false)
                {
                    warn!(
                        message = "Watched directory has been unavailable for over an hour.",
                        directory = %self.config.directory.display(),
                    );
                    unavailable_warned = true;
                }

                let wait = Duration::from_millis(self.config.dependency_poll_ms);
                tokio::select! {
                    () = tokio::time::sleep(wait) => continue,
                    () = cancel.cancelled() => break,
                }
            }
            if unavailable_since.take().is_some() {
                info!(
                    message = "Watched directory reappeared; restarting discovery.",
                    directory = %self.config.directory.display(),
                );
            }

            self.discover(&mut entries);

            let mut bytes_read_total = 0u64;
            let mut emitted = false;
            let fingerprints: Vec<FileFingerprint> = entries.keys().copied().collect();
            for fingerprint in fingerprints {
                let Some(entry) = entries.get_mut(&fingerprint) else {
                    continue;
                };
                if entry.watcher.dead() {
                    continue;
                }

                let before = entry.watcher.position();
                let records = self.read_records(entry, &cancel);
                bytes_read_total += entry.watcher.position() - before;

                if !records.is_empty() {
                    emitted = true;
                    if !self
                        .emit_records(entry, records, &output, &cancel)
                        .await
                    {
                        return;
                    }
                }
            }

            // Watchers whose files are gone (or rotated out of the filter
            // set and fully read) retire here; an unfinished multi-line
            // record is flushed on the way out.
            let mut retired = Vec::new();
            for (fingerprint, entry) in entries.iter() {
                if entry.watcher.dead() {
                    retired.push(*fingerprint);
                }
            }
            for fingerprint in retired {
                let mut entry = entries.remove(&fingerprint).expect("retired key exists");
                debug!(
                    message = "Retiring watcher.",
                    path = %entry.watcher.path.display(),
                );
                let mut tail = Vec::new();
                self.parser.flush(&mut entry.context, &mut tail);
                if !tail.is_empty() && !self.emit_records(&mut entry, tail, &output, &cancel).await
                {
                    return;
                }
            }

            counter!("bytes_read").increment(bytes_read_total);
            gauge!("files_to_process").set(entries.len() as f64);
            gauge!("bytes_to_read").set(
                entries
                    .values()
                    .map(|entry| {
                        std::fs::metadata(&entry.watcher.path)
                            .map(|meta| meta.len().saturating_sub(entry.watcher.position()))
                            .unwrap_or(0)
                    })
                    .sum::<u64>() as f64,
            );

            // Busy files poll at the configured period; a quiet tree backs
            // off exponentially to a small cap.
            idle_backoff_ms = if emitted || bytes_read_total > 0 {
                self.config.query_period_ms
            } else {
                (idle_backoff_ms * 2).min(MAX_IDLE_BACKOFF_MS)
            };
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(idle_backoff_ms)) => {}
                () = cancel.cancelled() => break,
            }
        }

        info!(
            message = "Directory source stopped.",
            source_id = self.config.id.as_str(),
        );
    }

    fn restore_bookmarks(&mut self) {
        if let Some(bytes) = self.bookmarks.load(&self.config.id) {
            match serde_json::from_slice::<FileBookmarkSet>(&bytes) {
                Ok(set) => {
                    for bookmark in set.files {
                        let sub = sub_key(bookmark.fingerprint);
                        self.sub_meta.insert(
                            sub.clone(),
                            SubMeta {
                                fingerprint: bookmark.fingerprint,
                                encoding: bookmark.encoding.clone(),
                            },
                        );
                        // Seed the manager so re-rendered bookmarks keep
                        // files we have not rediscovered yet.
                        self.bookmarks
                            .ack(&self.ack_key(&sub), bookmark.position as i64);
                        self.saved.insert(bookmark.fingerprint, bookmark);
                    }
                }
                Err(error) => {
                    error!(message = "Discarding unreadable bookmark.", %error);
                }
            }
        }

        let meta = Arc::clone(&self.sub_meta);
        self.bookmarks.register_source(
            &self.config.id,
            Box::new(move |view| {
                let mut files: Vec<FileBookmark> = view
                    .sub_positions()
                    .into_iter()
                    .filter_map(|(sub, position)| {
                        meta.get(&sub).map(|m| FileBookmark {
                            fingerprint: m.fingerprint,
                            position: position.max(0) as u64,
                            encoding: m.encoding.clone(),
                        })
                    })
                    .collect();
                files.sort_by_key(|file| file.fingerprint);
                serde_json::to_vec(&FileBookmarkSet { files }).ok()
            }),
        );
    }

    fn ack_key(&self, sub: &str) -> String {
        format!("{}:{sub}", self.config.id)
    }

    /// One discovery pass: glob the filters, refresh the findable flags,
    /// pick up renames, and open watchers for new fingerprints.
    fn discover(&mut self, entries: &mut HashMap<FileFingerprint, FileEntry>) {
        for entry in entries.values_mut() {
            entry.watcher.set_file_findable(false);
        }

        for path in self.matching_paths() {
            let fingerprint = match self.fingerprinter.fingerprint(&path) {
                Ok(fingerprint) => fingerprint,
                Err(error) => {
                    debug!(
                        message = "Could not fingerprint file.",
                        path = %path.display(),
                        %error,
                    );
                    continue;
                }
            };

            match entries.get_mut(&fingerprint) {
                Some(entry) => {
                    entry.watcher.set_file_findable(true);
                    if entry.watcher.path != path {
                        entry.watcher.update_path(path);
                    }
                }
                None => {
                    if let Some(entry) = self.open_entry(&path, fingerprint) {
                        info!(
                            message = "Found file to watch.",
                            path = %path.display(),
                            source_id = self.config.id.as_str(),
                        );
                        entries.insert(fingerprint, entry);
                    }
                }
            }
        }
    }

    fn matching_paths(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for filter in &self.config.name_filters {
            let pattern = if self.config.include_subdirectories {
                self.config.directory.join("**").join(filter)
            } else {
                self.config.directory.join(filter)
            };
            let Some(pattern) = pattern.to_str() else {
                continue;
            };
            match glob::glob(pattern) {
                Ok(paths) => {
                    for path in paths.flatten() {
                        if self.acceptable(&path) {
                            found.push(path);
                        }
                    }
                }
                Err(error) => {
                    warn!(message = "Invalid name filter.", filter = filter.as_str(), %error);
                }
            }
        }
        found.sort();
        found.dedup();
        found
    }

    fn acceptable(&self, path: &Path) -> bool {
        // Symlinks are followed: metadata() resolves the target.
        let is_file = std::fs::metadata(path)
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return false;
        }

        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            if ARCHIVE_EXTENSIONS
                .iter()
                .any(|archive| archive.eq_ignore_ascii_case(extension))
            {
                return false;
            }
        }

        if let Some(filter) = &self.config.include_directory_filter {
            let parent = path
                .parent()
                .map(|parent| parent.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            if !parent.contains(&filter.replace('\\', "/")) {
                return false;
            }
        }
        true
    }

    fn open_entry(&self, path: &Path, fingerprint: FileFingerprint) -> Option<FileEntry> {
        let saved = self.saved.get(&fingerprint);
        let saved_encoding = saved
            .and_then(|bookmark| bookmark.encoding.as_deref())
            .and_then(Encoding::from_name);
        let encoding = self.forced_encoding.or(saved_encoding);

        // A saved bookmark always wins; the initial-position policy only
        // decides where to start a file we have never recorded progress
        // for.
        let read_from = match saved {
            Some(bookmark) => ReadFrom::Checkpoint(bookmark.position),
            None => match self.config.initial_position {
                InitialPosition::Eos => ReadFrom::End,
                InitialPosition::Bos
                | InitialPosition::Bookmark
                | InitialPosition::Timestamp => ReadFrom::Beginning,
            },
        };

        let start_line_number = match read_from {
            ReadFrom::Checkpoint(position) if position > 0 => std::fs::File::open(path)
                .and_then(|file| {
                    count_lines(file, encoding.unwrap_or(Encoding::Utf8), position)
                })
                .unwrap_or(0),
            _ => 0,
        };

        let watcher = match FileWatcher::new(
            path.to_path_buf(),
            read_from,
            encoding,
            start_line_number,
            self.config.max_line_bytes,
        ) {
            Ok(watcher) => watcher,
            Err(error) => {
                warn!(
                    message = "Failed to open file for watching.",
                    path = %path.display(),
                    %error,
                );
                return None;
            }
        };

        let sub = sub_key(fingerprint);
        self.sub_meta.insert(
            sub.clone(),
            SubMeta {
                fingerprint,
                encoding: watcher.encoding().map(|encoding| encoding.name().to_owned()),
            },
        );

        let context = ParseContext {
            position: watcher.position(),
            line_number: start_line_number,
            ..Default::default()
        };
        Some(FileEntry {
            watcher,
            context,
            sub_key: sub,
        })
    }

    fn read_records(
        &self,
        entry: &mut FileEntry,
        cancel: &CancellationToken,
    ) -> Vec<ParsedRecord> {
        let mut out = Vec::new();
        let result = self.parser.parse_records(
            &mut entry.context,
            &mut entry.watcher,
            &mut out,
            MAX_RECORDS_PER_PASS,
            cancel,
        );
        if let Err(error) = result {
            error!(
                message = "Error while reading file; will retry.",
                path = %entry.watcher.path.display(),
                %error,
            );
            counter!("file_read_errors_total").increment(1);
        }

        // Cache the encoding detected on first read so a restart can
        // resume mid-file without a BOM to look at.
        if let Some(encoding) = entry.watcher.encoding() {
            if let Some(mut meta) = self.sub_meta.get_mut(&entry.sub_key) {
                if meta.encoding.is_none() {
                    meta.encoding = Some(encoding.name().to_owned());
                }
            }
        }
        out
    }

    /// Send records downstream; returns false when the pipeline is gone.
    async fn emit_records(
        &self,
        entry: &mut FileEntry,
        records: Vec<ParsedRecord>,
        output: &mpsc::Sender<Envelope<LogRecord>>,
        cancel: &CancellationToken,
    ) -> bool {
        let ack_key = self.ack_key(&entry.sub_key);
        let mut last_position = None;

        for record in records {
            if let (InitialPosition::Timestamp, Some(cutoff)) = (
                self.config.initial_position,
                self.config.initial_position_timestamp,
            ) {
                if record
                    .timestamp
                    .map(|timestamp| timestamp < cutoff)
                    .unwrap_or(false)
                {
                    last_position = Some(record.position);
                    continue;
                }
            }

            let position = record.position;
            let line_number = record.line_number;
            let timestamp = record.timestamp;
            let envelope = Envelope::new(LogRecord::from(record), timestamp)
                .with_bookmark(ack_key.clone(), position as i64)
                .with_source_path(entry.watcher.path.clone())
                .with_line_number(line_number);

            tokio::select! {
                sent = output.send(envelope) => {
                    if sent.is_err() {
                        warn!(message = "Output channel closed; stopping source.");
                        return false;
                    }
                }
                () = cancel.cancelled() => return false,
            }
            counter!("records_read").increment(1);
            last_position = Some(position);
        }

        if !self.config.bookmark_on_buffer_flush {
            if let Some(position) = last_position {
                self.bookmarks.ack(&ack_key, position as i64);
                if let Err(error) = self.bookmarks.commit_now(&self.config.id) {
                    error!(message = "Failed to write bookmark.", %error);
                }
            }
        }
        true
    }
}

fn sub_key(fingerprint: FileFingerprint) -> String {
    match fingerprint {
        FileFingerprint::DevInode(dev, ino) => format!("i{dev:x}.{ino:x}"),
        FileFingerprint::FirstLineChecksum(sum) => format!("h{sum:x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_position_requires_timestamp() {
        let config = DirectorySourceConfig {
            id: "src".into(),
            directory: "/tmp".into(),
            name_filters: vec!["*.log".into()],
            include_subdirectories: false,
            include_directory_filter: None,
            query_period_ms: 100,
            initial_position: InitialPosition::Timestamp,
            initial_position_timestamp: None,
            bookmark_on_buffer_flush: true,
            encoding: None,
            max_line_bytes: 1024,
            dependency_poll_ms: 100,
        };
        let bookmarks = BookmarkManager::new(
            crate::bookmarks::BookmarkStore::new(tempfile::tempdir().unwrap().path()).unwrap(),
            Duration::from_secs(20),
        );
        let result = DirectorySource::new(
            config,
            Box::new(logtap_parsers::SingleLineParser),
            bookmarks,
        );
        assert!(matches!(
            result,
            Err(SourceConfigError::MissingInitialTimestamp)
        ));
    }

    #[test]
    fn archive_extensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.log.gz", "b.zip", "c.tar", "d.bz2"] {
            std::fs::write(dir.path().join(name), "x\n").unwrap();
        }
        std::fs::write(dir.path().join("keep.log"), "x\n").unwrap();

        let bookmarks = BookmarkManager::new(
            crate::bookmarks::BookmarkStore::new(tempfile::tempdir().unwrap().path()).unwrap(),
            Duration::from_secs(20),
        );
        let source = DirectorySource::new(
            DirectorySourceConfig {
                id: "src".into(),
                directory: dir.path().to_path_buf(),
                name_filters: vec!["*".into()],
                include_subdirectories: false,
                include_directory_filter: None,
                query_period_ms: 100,
                initial_position: InitialPosition::Bos,
                initial_position_timestamp: None,
                bookmark_on_buffer_flush: true,
                encoding: None,
                max_line_bytes: 1024,
                dependency_poll_ms: 100,
            },
            Box::new(logtap_parsers::SingleLineParser),
            bookmarks,
        )
        .unwrap();

        let paths = source.matching_paths();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("keep.log"));
    }

    #[test]
    fn directory_filter_is_substring_on_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("svc-a/logs")).unwrap();
        std::fs::create_dir_all(dir.path().join("svc-b/logs")).unwrap();
        std::fs::write(dir.path().join("svc-a/logs/app.log"), "x\n").unwrap();
        std::fs::write(dir.path().join("svc-b/logs/app.log"), "x\n").unwrap();

        let bookmarks = BookmarkManager::new(
            crate::bookmarks::BookmarkStore::new(tempfile::tempdir().unwrap().path()).unwrap(),
            Duration::from_secs(20),
        );
        let source = DirectorySource::new(
            DirectorySourceConfig {
                id: "src".into(),
                directory: dir.path().to_path_buf(),
                name_filters: vec!["*.log".into()],
                include_subdirectories: true,
                include_directory_filter: Some("svc-a/logs".into()),
                query_period_ms: 100,
                initial_position: InitialPosition::Bos,
                initial_position_timestamp: None,
                bookmark_on_buffer_flush: true,
                encoding: None,
                max_line_bytes: 1024,
                dependency_poll_ms: 100,
            },
            Box::new(logtap_parsers::SingleLineParser),
            bookmarks,
        )
        .unwrap();

        let paths = source.matching_paths();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].to_string_lossy().contains("svc-a"));
    }
}
