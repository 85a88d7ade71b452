use std::{
    fs, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(20);

/// Renders a source's current acknowledged progress into the opaque bytes
/// persisted for it. Called with a view over the manager's in-memory
/// positions at flush time.
pub type RenderFn = Box<dyn Fn(&BookmarkView<'_>) -> Option<Vec<u8>> + Send + Sync>;

/// Durable storage of per-source bookmark files, one
/// `<directory>/<source_id>.bm` each, written atomically through a tmp
/// file.
pub struct BookmarkStore {
    directory: PathBuf,
}

impl BookmarkStore {
    pub fn new(directory: impl Into<PathBuf>) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    fn path_for(&self, source_id: &str) -> PathBuf {
        self.directory.join(format!("{source_id}.bm"))
    }

    pub fn load(&self, source_id: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(source_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub fn save(&self, source_id: &str, bytes: &[u8]) -> io::Result<()> {
        let tmp_path = self.directory.join(format!("{source_id}.bm.new"));
        let mut file = fs::File::create(&tmp_path)?;
        io::Write::write_all(&mut file, bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, self.path_for(source_id))
    }

    pub fn remove(&self, source_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(source_id)) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
            _ => Ok(()),
        }
    }
}

struct Entry {
    position: AtomicI64,
    dirty: AtomicBool,
}

/// Tracks acknowledged progress per bookmark key and persists it.
///
/// Keys are either a bare source id or `source_id:sub` for sources that
/// track several sub-streams (one per watched file). Positions are
/// monotonic: a stale ack never moves a bookmark backwards.
///
/// In on-flush mode the sink acks after successful sends and a background
/// task persists dirty sources every `flush_interval`; `stop` drops the
/// interval to zero and forces a final write. Sources running with
/// immediate bookmarks call [`BookmarkManager::commit_now`] themselves.
pub struct BookmarkManager {
    store: BookmarkStore,
    entries: DashMap<String, Arc<Entry>>,
    renderers: DashMap<String, RenderFn>,
    flush_interval: Duration,
    flush_now: AtomicBool,
    write_lock: Mutex<()>,
}

impl BookmarkManager {
    pub fn new(store: BookmarkStore, flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            entries: DashMap::new(),
            renderers: DashMap::new(),
            flush_interval,
            flush_now: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        })
    }

    /// Register a source and how to serialize its progress. Replaces any
    /// previous registration for the same id.
    pub fn register_source(&self, source_id: &str, render: RenderFn) {
        self.renderers.insert(source_id.to_owned(), render);
    }

    /// Load the persisted bookmark for a source, `None` when starting
    /// fresh.
    pub fn load(&self, source_id: &str) -> Option<Vec<u8>> {
        match self.store.load(source_id) {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(message = "Failed to load bookmark.", source_id, %error);
                None
            }
        }
    }

    /// Record that everything up to `position` under `key` is durable
    /// downstream. Stale positions are ignored.
    pub fn ack(&self, key: &str, position: i64) {
        let entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| {
                Arc::new(Entry {
                    position: AtomicI64::new(i64::MIN),
                    dirty: AtomicBool::new(false),
                })
            })
            .clone();

        let previous = entry.position.fetch_max(position, Ordering::AcqRel);
        if position > previous {
            entry.dirty.store(true, Ordering::Release);
        }
    }

    /// The highest acknowledged position for `key`, if any.
    pub fn position(&self, key: &str) -> Option<i64> {
        self.entries
            .get(key)
            .map(|entry| entry.position.load(Ordering::Acquire))
            .filter(|position| *position != i64::MIN)
    }

    /// Persist one source's bookmark immediately, regardless of dirtiness.
    /// Used by sources running with immediate (non-buffered) bookmarks.
    pub fn commit_now(&self, source_id: &str) -> io::Result<()> {
        self.write_source(source_id, true)?;
        Ok(())
    }

    /// Persist every source with un-flushed acks. Returns how many
    /// bookmark files were written.
    pub fn flush_dirty(&self) -> usize {
        let mut written = 0;
        for renderer in self.renderers.iter() {
            match self.write_source(renderer.key(), false) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(error) => {
                    error!(
                        message = "Failed to persist bookmark.",
                        source_id = renderer.key().as_str(),
                        %error,
                    );
                }
            }
        }
        written
    }

    fn write_source(&self, source_id: &str, force: bool) -> io::Result<bool> {
        let dirty = self.take_dirty(source_id);
        if !dirty && !force {
            return Ok(false);
        }

        let Some(renderer) = self.renderers.get(source_id) else {
            return Ok(false);
        };
        let view = BookmarkView {
            manager: self,
            source_id,
        };
        let Some(bytes) = (renderer.value())(&view) else {
            return Ok(false);
        };

        let _guard = self.write_lock.lock().expect("Data poisoned.");
        self.store.save(source_id, &bytes)?;
        Ok(true)
    }

    fn take_dirty(&self, source_id: &str) -> bool {
        let mut dirty = false;
        for entry in self.entries.iter() {
            if key_belongs_to(entry.key(), source_id)
                && entry.value().dirty.swap(false, Ordering::AcqRel)
            {
                dirty = true;
            }
        }
        dirty
    }

    /// Run the periodic flusher until cancelled, then force a final
    /// flush.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = if self.flush_now.load(Ordering::Acquire) {
                Duration::ZERO
            } else {
                self.flush_interval
            };

            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    self.flush_dirty();
                }
                () = cancel.cancelled() => break,
            }
        }
        self.flush_dirty();
    }

    /// Enter flush-now mode (remaining writes persist immediately) and
    /// force a flush of everything outstanding.
    pub fn stop(&self) {
        self.flush_now.store(true, Ordering::Release);
        self.flush_dirty();
        info!(message = "Bookmark manager stopped; final flush complete.");
    }
}

fn key_belongs_to(key: &str, source_id: &str) -> bool {
    key == source_id
        || (key.len() > source_id.len()
            && key.starts_with(source_id)
            && key.as_bytes()[source_id.len()] == b':')
}

/// Read-only access to a source's acknowledged positions during a render,
/// keeping renderers free of references back into the manager.
pub struct BookmarkView<'a> {
    manager: &'a BookmarkManager,
    source_id: &'a str,
}

impl BookmarkView<'_> {
    /// Position acked under the bare source id.
    pub fn position(&self) -> Option<i64> {
        self.manager.position(self.source_id)
    }

    /// All `(sub_key, position)` pairs acked under `source_id:sub` keys.
    pub fn sub_positions(&self) -> Vec<(String, i64)> {
        let prefix_len = self.source_id.len() + 1;
        self.manager
            .entries
            .iter()
            .filter(|entry| {
                entry.key() != self.source_id && key_belongs_to(entry.key(), self.source_id)
            })
            .filter_map(|entry| {
                let position = entry.value().position.load(Ordering::Acquire);
                (position != i64::MIN)
                    .then(|| (entry.key()[prefix_len..].to_owned(), position))
            })
            .collect()
    }
}
