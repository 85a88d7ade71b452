use std::{
    fs, io,
    io::Write,
    marker::PhantomData,
    path::PathBuf,
};

use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::SimpleQueue;

const INDEX_FILE_NAME: &str = "Index";
const TMP_FILE_NAME: &str = "item.new.json";

/// Capacities beyond this would not fit the zero-padded nine-digit item
/// file names.
pub const MAX_CAPACITY: u64 = 1_000_000_000;

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("queue at {} is full ({capacity} items)", directory.display()))]
    CapacityExceeded { directory: PathBuf, capacity: u64 },

    #[snafu(display("capacity must be between 1 and {MAX_CAPACITY}, got {capacity}"))]
    InvalidCapacity { capacity: u64 },

    #[snafu(display("queue I/O error at {}: {source}", directory.display()))]
    Io {
        directory: PathBuf,
        source: io::Error,
    },

    #[snafu(display("malformed index file {}: {content:?}", path.display()))]
    MalformedIndex { path: PathBuf, content: String },
}

/// A durable bounded FIFO of serialized items.
///
/// Each item lives in its own file named by a zero-padded nine-digit index;
/// an `Index` file records `"<head> <tail>"`. Both counters are monotonic,
/// so the layout is append-at-tail, consume-at-head, and the index file is
/// rewritten (atomically, via a tmp file) after every successful operation
/// before that operation is observable to another process.
///
/// Items that fail to deserialize on dequeue are skipped, not retried:
/// `head` advances regardless so one poison item can never wedge the queue.
pub struct PersistentQueue<T> {
    directory: PathBuf,
    capacity: u64,
    head: u64,
    tail: u64,
    _item: PhantomData<fn() -> T>,
}

impl<T> PersistentQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (or create) a queue rooted at `directory`, recovering `head`
    /// and `tail` from a previous run when an index file is present.
    pub fn open(directory: impl Into<PathBuf>, capacity: u64) -> Result<Self, QueueError> {
        ensure!(
            capacity > 0 && capacity <= MAX_CAPACITY,
            InvalidCapacitySnafu { capacity }
        );

        let directory = directory.into();
        fs::create_dir_all(&directory).context(IoSnafu {
            directory: directory.clone(),
        })?;

        let mut queue = Self {
            directory,
            capacity,
            head: 0,
            tail: 0,
            _item: PhantomData,
        };
        queue.recover()?;
        Ok(queue)
    }

    pub fn len(&self) -> u64 {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Serialize `item` into the next tail slot.
    ///
    /// The item file is written to a tmp path and renamed into place so a
    /// crash mid-write can never leave a truncated item at a live index.
    pub fn enqueue(&mut self, item: &T) -> Result<(), QueueError> {
        ensure!(
            self.len() < self.capacity,
            CapacityExceededSnafu {
                directory: self.directory.clone(),
                capacity: self.capacity,
            }
        );

        let tmp_path = self.directory.join(TMP_FILE_NAME);
        self.io(|this| {
            let mut file = io::BufWriter::new(fs::File::create(&tmp_path)?);
            serde_json::to_writer(&mut file, item)
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
            file.into_inner()?.sync_all()?;
            fs::rename(&tmp_path, this.item_path(this.tail))
        })?;

        self.tail += 1;
        self.write_index()
    }

    /// Remove and return the item at `head`, or `None` when the queue is
    /// empty.
    ///
    /// A head item that cannot be read back is dropped: its file is
    /// deleted, `head` advances, and the scan moves on to the next index.
    pub fn dequeue(&mut self) -> Result<Option<T>, QueueError> {
        while !self.is_empty() {
            let path = self.item_path(self.head);
            let bytes = match fs::read(&path) {
                Ok(bytes) => Some(bytes),
                Err(error) if error.kind() == io::ErrorKind::NotFound => None,
                Err(error) => {
                    return Err(QueueError::Io {
                        directory: self.directory.clone(),
                        source: error,
                    })
                }
            };

            self.io(|_| match fs::remove_file(&path) {
                Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
                _ => Ok(()),
            })?;
            self.head += 1;
            self.write_index()?;

            match bytes.as_deref().map(serde_json::from_slice) {
                Some(Ok(item)) => return Ok(Some(item)),
                Some(Err(error)) => {
                    error!(
                        message = "Dropping persistent queue item that failed to deserialize.",
                        path = %path.display(),
                        %error,
                    );
                    counter!("persistent_queue_poison_total").increment(1);
                }
                None => {
                    error!(
                        message = "Persistent queue item file is missing; skipping index.",
                        path = %path.display(),
                    );
                    counter!("persistent_queue_poison_total").increment(1);
                }
            }
        }

        Ok(None)
    }

    fn item_path(&self, index: u64) -> PathBuf {
        self.directory.join(format!("{index:09}"))
    }

    fn recover(&mut self) -> Result<(), QueueError> {
        let index_path = self.directory.join(INDEX_FILE_NAME);
        let content = match fs::read_to_string(&index_path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return self.write_index();
            }
            Err(error) => {
                return Err(QueueError::Io {
                    directory: self.directory.clone(),
                    source: error,
                })
            }
        };

        let mut parts = content.split_whitespace();
        let (head, tail) = match (
            parts.next().and_then(|p| p.parse::<u64>().ok()),
            parts.next().and_then(|p| p.parse::<u64>().ok()),
        ) {
            (Some(head), Some(tail)) if head <= tail => (head, tail),
            _ => {
                return Err(QueueError::MalformedIndex {
                    path: index_path,
                    content,
                })
            }
        };

        self.head = head;
        self.tail = tail;

        // The index is rewritten after item files change, so the recorded
        // head may lag a completed dequeue by one crash. Fast-forward to
        // the first item file that actually exists.
        while self.head < self.tail && !self.item_path(self.head).exists() {
            warn!(
                message = "Skipping missing item file during queue recovery.",
                index = self.head,
            );
            self.head += 1;
        }
        self.write_index()
    }

    fn write_index(&mut self) -> Result<(), QueueError> {
        let index_path = self.directory.join(INDEX_FILE_NAME);
        let tmp_path = self.directory.join("Index.new");
        let head = self.head;
        let tail = self.tail;
        self.io(move |_| {
            let mut file = fs::File::create(&tmp_path)?;
            write!(file, "{head} {tail}")?;
            file.sync_all()?;
            fs::rename(&tmp_path, &index_path)
        })
    }

    fn io(
        &mut self,
        operation: impl FnOnce(&Self) -> io::Result<()>,
    ) -> Result<(), QueueError> {
        operation(self).context(IoSnafu {
            directory: self.directory.clone(),
        })
    }
}

/// Durable overflow tier: `enqueue` refuses (handing the item back) when
/// the queue is at capacity so callers can fall through to blocking on the
/// primary instead.
impl<T> SimpleQueue<T> for PersistentQueue<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn enqueue(&mut self, item: T) -> Result<(), T> {
        match PersistentQueue::enqueue(self, &item) {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(message = "Failed to enqueue to persistent queue.", %error);
                Err(item)
            }
        }
    }

    fn dequeue(&mut self) -> Option<T> {
        match PersistentQueue::dequeue(self) {
            Ok(item) => item,
            Err(error) => {
                error!(message = "Failed to dequeue from persistent queue.", %error);
                None
            }
        }
    }

    fn is_empty(&self) -> bool {
        PersistentQueue::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn fifo_in_single_run() {
        let dir = tempdir().unwrap();
        let mut queue = PersistentQueue::open(dir.path(), 16).unwrap();

        for value in ["a", "b", "c"] {
            queue.enqueue(&value.to_string()).unwrap();
        }

        assert_eq!(queue.dequeue().unwrap(), Some("a".to_string()));
        assert_eq!(queue.dequeue().unwrap(), Some("b".to_string()));
        assert_eq!(queue.dequeue().unwrap(), Some("c".to_string()));
        assert_eq!(queue.dequeue().unwrap(), None);
    }

    #[test]
    fn survives_restart_between_operations() {
        let dir = tempdir().unwrap();
        {
            let mut queue = PersistentQueue::open(dir.path(), 16).unwrap();
            for value in ["a", "b", "c"] {
                queue.enqueue(&value.to_string()).unwrap();
            }
            // Queue dropped here without any clean shutdown, as in a crash.
        }

        let mut queue = PersistentQueue::<String>::open(dir.path(), 16).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap(), Some("a".to_string()));
        assert_eq!(queue.dequeue().unwrap(), Some("b".to_string()));
        assert_eq!(queue.len(), 1);

        let mut queue = PersistentQueue::<String>::open(dir.path(), 16).unwrap();
        assert_eq!(queue.dequeue().unwrap(), Some("c".to_string()));
        assert_eq!(queue.dequeue().unwrap(), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = tempdir().unwrap();
        let mut queue = PersistentQueue::open(dir.path(), 2).unwrap();

        queue.enqueue(&1u32).unwrap();
        queue.enqueue(&2u32).unwrap();
        let error = queue.enqueue(&3u32).unwrap_err();
        assert!(matches!(error, QueueError::CapacityExceeded { .. }));

        // Draining one frees a slot.
        assert_eq!(queue.dequeue().unwrap(), Some(1));
        queue.enqueue(&3u32).unwrap();
    }

    #[test]
    fn invalid_capacity_rejected() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            PersistentQueue::<u32>::open(dir.path(), 0),
            Err(QueueError::InvalidCapacity { .. })
        ));
        assert!(matches!(
            PersistentQueue::<u32>::open(dir.path(), MAX_CAPACITY + 1),
            Err(QueueError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn poison_item_is_skipped_and_head_advances() {
        let dir = tempdir().unwrap();
        let mut queue = PersistentQueue::open(dir.path(), 16).unwrap();

        queue.enqueue(&"good".to_string()).unwrap();
        queue.enqueue(&"bad".to_string()).unwrap();
        queue.enqueue(&"also good".to_string()).unwrap();

        // Corrupt the middle item on disk.
        fs::write(dir.path().join(format!("{:09}", 1)), b"{not json").unwrap();

        assert_eq!(queue.dequeue().unwrap(), Some("good".to_string()));
        // The poison item is silently absent from the caller's view.
        assert_eq!(queue.dequeue().unwrap(), Some("also good".to_string()));
        assert_eq!(queue.dequeue().unwrap(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn recovery_skips_missing_head_files() {
        let dir = tempdir().unwrap();
        {
            let mut queue = PersistentQueue::open(dir.path(), 16).unwrap();
            for value in 0..4u32 {
                queue.enqueue(&value).unwrap();
            }
        }

        // Simulate a dequeue that deleted its file but died before the
        // index rewrite landed.
        fs::remove_file(dir.path().join(format!("{:09}", 0))).unwrap();
        fs::write(dir.path().join(INDEX_FILE_NAME), "0 4").unwrap();

        let mut queue = PersistentQueue::<u32>::open(dir.path(), 16).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap(), Some(1));
    }

    #[test]
    fn malformed_index_is_an_error() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(INDEX_FILE_NAME), "bogus").unwrap();

        assert!(matches!(
            PersistentQueue::<u32>::open(dir.path(), 16),
            Err(QueueError::MalformedIndex { .. })
        ));
    }
}
