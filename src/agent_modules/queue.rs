//! Durable FIFO shared by the sampler (producer) and the uploader (consumer).
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info};

/// Sequence number given to the first entry of a fresh store. Starting in the
/// middle of the key space leaves room for head re-inserts below it.
const INITIAL_SEQUENCE: u64 = 1 << 63;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue store error: {0}")]
    Store(#[from] sled::Error),
    #[error("Queue store holds a key of unexpected length {0}")]
    CorruptKey(usize),
    #[error("Queue store has no room left below the head entry")]
    HeadExhausted,
    #[error("Queue lock poisoned")]
    Poisoned,
    #[error("Queue task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Ordered append/pop sequence of serialized readings.
///
/// Implementations must be safe for one producer and one consumer running
/// concurrently: an append racing with a drain is neither lost nor delivered
/// twice. Methods may block on disk I/O; async callers go through
/// [`append_blocking`], [`drain_blocking`] and [`requeue_front_blocking`].
pub trait ReadingQueue: Send + Sync {
    fn append(&self, entry: &[u8]) -> Result<(), QueueError>;

    fn len(&self) -> Result<usize, QueueError>;

    /// Removes and returns the oldest entry, `None` once the queue is empty.
    /// The removal may stay unpersisted until the next [`ReadingQueue::sync`].
    fn pop_front(&self) -> Result<Option<Vec<u8>>, QueueError>;

    /// Puts `entries` back ahead of everything currently queued, keeping their
    /// relative order. Only the consumer calls this.
    fn requeue_front(&self, entries: Vec<Vec<u8>>) -> Result<(), QueueError>;

    /// Persists pending removals.
    fn sync(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

/// Pops exactly as many entries as the queue held when the drain started.
///
/// Entries appended while the drain is running stay queued for the next one.
/// If a pop fails midway, the entries already taken are put back at the head.
/// Removals are persisted once, after the last pop.
pub fn drain(queue: &dyn ReadingQueue) -> Result<Vec<Vec<u8>>, QueueError> {
    let snapshot = queue.len()?;
    let mut drained = Vec::with_capacity(snapshot);

    for _ in 0..snapshot {
        match queue.pop_front() {
            Ok(Some(entry)) => drained.push(entry),
            Ok(None) => break,
            Err(e) => {
                let taken = drained.len();
                if taken > 0 {
                    if let Err(requeue_err) = queue.requeue_front(drained) {
                        error!(error = %requeue_err, lost = taken, "Failed to restore entries after an aborted drain.");
                    }
                }
                return Err(e);
            }
        }
    }

    if !drained.is_empty() {
        // An unpersisted pop can only resurface as a duplicate after a crash.
        if let Err(e) = queue.sync() {
            error!(error = %e, drained = drained.len(), "Failed to persist drained entries; they may be delivered again after a restart.");
        }
    }
    Ok(drained)
}

/// [`ReadingQueue::append`] on the blocking thread pool.
pub async fn append_blocking(queue: &Arc<dyn ReadingQueue>, entry: Vec<u8>) -> Result<(), QueueError> {
    let queue = Arc::clone(queue);
    tokio::task::spawn_blocking(move || queue.append(&entry)).await?
}

/// [`drain`] on the blocking thread pool.
pub async fn drain_blocking(queue: &Arc<dyn ReadingQueue>) -> Result<Vec<Vec<u8>>, QueueError> {
    let queue = Arc::clone(queue);
    tokio::task::spawn_blocking(move || drain(queue.as_ref())).await?
}

/// [`ReadingQueue::requeue_front`] on the blocking thread pool.
pub async fn requeue_front_blocking(
    queue: &Arc<dyn ReadingQueue>,
    entries: Vec<Vec<u8>>,
) -> Result<(), QueueError> {
    let queue = Arc::clone(queue);
    tokio::task::spawn_blocking(move || queue.requeue_front(entries)).await?
}

/// Queue persisted in a sled tree, keyed by big-endian sequence numbers.
///
/// Appends take keys upward from `next_sequence`; re-queued entries take keys
/// downward from `head`. The two ranges never meet, so a re-queue can not
/// collide with an append that reserved its key but has not inserted yet.
pub struct SledQueue {
    tree: sled::Tree,
    next_sequence: AtomicU64,
    head: AtomicU64,
    flush_on_write: bool,
}

impl SledQueue {
    pub fn open<P: AsRef<Path>>(path: P, tree_name: &str, flush_on_write: bool) -> Result<Self, QueueError> {
        let db = sled::Config::new().path(path.as_ref()).open()?;
        let queue = Self::from_tree(db.open_tree(tree_name)?, flush_on_write)?;
        info!(
            path = %path.as_ref().display(),
            tree = tree_name,
            pending = queue.tree.len(),
            "Opened durable reading queue."
        );
        Ok(queue)
    }

    pub fn from_tree(tree: sled::Tree, flush_on_write: bool) -> Result<Self, QueueError> {
        let next_sequence = match tree.last()? {
            Some((key, _)) => decode_key(&key)? + 1,
            None => INITIAL_SEQUENCE,
        };
        let head = match tree.first()? {
            Some((key, _)) => decode_key(&key)?,
            None => next_sequence,
        };
        Ok(Self {
            tree,
            next_sequence: AtomicU64::new(next_sequence),
            head: AtomicU64::new(head),
            flush_on_write,
        })
    }

    fn flush_if_configured(&self) -> Result<(), QueueError> {
        if self.flush_on_write {
            self.tree.flush()?;
        }
        Ok(())
    }
}

impl ReadingQueue for SledQueue {
    fn append(&self, entry: &[u8]) -> Result<(), QueueError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.tree.insert(sequence.to_be_bytes(), entry)?;
        self.flush_if_configured()
    }

    fn len(&self) -> Result<usize, QueueError> {
        Ok(self.tree.len())
    }

    fn pop_front(&self) -> Result<Option<Vec<u8>>, QueueError> {
        Ok(self.tree.pop_min()?.map(|(_, value)| value.to_vec()))
    }

    fn requeue_front(&self, entries: Vec<Vec<u8>>) -> Result<(), QueueError> {
        if entries.is_empty() {
            return Ok(());
        }

        let count = entries.len() as u64;
        let previous_head = self
            .head
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |head| head.checked_sub(count))
            .map_err(|_| QueueError::HeadExhausted)?;
        let start = previous_head - count;

        let mut batch = sled::Batch::default();
        for (offset, entry) in entries.into_iter().enumerate() {
            batch.insert((start + offset as u64).to_be_bytes().to_vec(), entry);
        }
        self.tree.apply_batch(batch)?;
        self.flush_if_configured()
    }

    fn sync(&self) -> Result<(), QueueError> {
        self.flush_if_configured()
    }
}

fn decode_key(key: &[u8]) -> Result<u64, QueueError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| QueueError::CorruptKey(key.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Non-durable queue with the same contract, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryQueue {
    entries: Mutex<VecDeque<Vec<u8>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadingQueue for MemoryQueue {
    fn append(&self, entry: &[u8]) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        entries.push_back(entry.to_vec());
        Ok(())
    }

    fn len(&self) -> Result<usize, QueueError> {
        let entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(entries.len())
    }

    fn pop_front(&self) -> Result<Option<Vec<u8>>, QueueError> {
        let mut entries = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(entries.pop_front())
    }

    fn requeue_front(&self, entries: Vec<Vec<u8>>) -> Result<(), QueueError> {
        let mut queued = self.entries.lock().map_err(|_| QueueError::Poisoned)?;
        for entry in entries.into_iter().rev() {
            queued.push_front(entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entry(n: u32) -> Vec<u8> {
        n.to_string().into_bytes()
    }

    fn as_numbers(entries: &[Vec<u8>]) -> Vec<u32> {
        entries
            .iter()
            .map(|e| String::from_utf8(e.clone()).unwrap().parse().unwrap())
            .collect()
    }

    fn open_temp_queue(dir: &tempfile::TempDir) -> SledQueue {
        SledQueue::open(dir.path(), "test_queue", false).unwrap()
    }

    /// Delegates to a memory queue, injects one append during the first pop and
    /// counts syncs.
    struct AppendDuringPop {
        inner: MemoryQueue,
        injected: Mutex<bool>,
        syncs: Mutex<usize>,
    }

    impl ReadingQueue for AppendDuringPop {
        fn append(&self, entry: &[u8]) -> Result<(), QueueError> {
            self.inner.append(entry)
        }

        fn len(&self) -> Result<usize, QueueError> {
            self.inner.len()
        }

        fn pop_front(&self) -> Result<Option<Vec<u8>>, QueueError> {
            let mut injected = self.injected.lock().unwrap();
            if !*injected {
                *injected = true;
                self.inner.append(&entry(99))?;
            }
            self.inner.pop_front()
        }

        fn requeue_front(&self, entries: Vec<Vec<u8>>) -> Result<(), QueueError> {
            self.inner.requeue_front(entries)
        }

        fn sync(&self) -> Result<(), QueueError> {
            *self.syncs.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_memory_queue_is_fifo() {
        let queue = MemoryQueue::new();
        for n in 1..=3 {
            queue.append(&entry(n)).unwrap();
        }

        assert_eq!(queue.len().unwrap(), 3);
        assert_eq!(queue.pop_front().unwrap(), Some(entry(1)));
        assert_eq!(queue.pop_front().unwrap(), Some(entry(2)));
        assert_eq!(queue.pop_front().unwrap(), Some(entry(3)));
        assert_eq!(queue.pop_front().unwrap(), None);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_drain_stops_at_snapshot_length() {
        let queue = AppendDuringPop {
            inner: MemoryQueue::new(),
            injected: Mutex::new(false),
            syncs: Mutex::new(0),
        };
        for n in 1..=3 {
            queue.append(&entry(n)).unwrap();
        }

        let first = drain(&queue).unwrap();
        assert_eq!(as_numbers(&first), vec![1, 2, 3]);
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(*queue.syncs.lock().unwrap(), 1);

        let second = drain(&queue).unwrap();
        assert_eq!(as_numbers(&second), vec![99]);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_drain_of_empty_queue_is_empty() {
        let queue = MemoryQueue::new();
        assert!(drain(&queue).unwrap().is_empty());
    }

    #[test]
    fn test_memory_requeue_front_keeps_order() {
        let queue = MemoryQueue::new();
        queue.append(&entry(4)).unwrap();

        queue.requeue_front(vec![entry(1), entry(2), entry(3)]).unwrap();

        assert_eq!(as_numbers(&drain(&queue).unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_sled_queue_is_fifo_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = open_temp_queue(&dir);
            for n in 1..=3 {
                queue.append(&entry(n)).unwrap();
            }
            assert_eq!(queue.pop_front().unwrap(), Some(entry(1)));
            queue.tree.flush().unwrap();
        }

        let reopened = open_temp_queue(&dir);
        assert_eq!(reopened.len().unwrap(), 2);
        reopened.append(&entry(4)).unwrap();
        assert_eq!(as_numbers(&drain(&reopened).unwrap()), vec![2, 3, 4]);
    }

    #[test]
    fn test_sled_requeue_front_goes_ahead_of_pending_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_temp_queue(&dir);
        for n in 1..=3 {
            queue.append(&entry(n)).unwrap();
        }
        let drained = drain(&queue).unwrap();
        queue.append(&entry(4)).unwrap();

        queue.requeue_front(drained).unwrap();

        assert_eq!(queue.len().unwrap(), 4);
        assert_eq!(as_numbers(&drain(&queue).unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_sled_requeue_into_empty_queue_stays_below_new_appends() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_temp_queue(&dir);
        queue.append(&entry(1)).unwrap();
        let drained = drain(&queue).unwrap();

        queue.requeue_front(drained).unwrap();
        queue.append(&entry(2)).unwrap();

        assert_eq!(as_numbers(&drain(&queue).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_sled_requeue_does_not_overwrite_reserved_append() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_temp_queue(&dir);
        queue.append(&entry(1)).unwrap();
        let drained = drain(&queue).unwrap();

        // Producer has taken its key but not inserted yet.
        let reserved = queue.next_sequence.fetch_add(1, Ordering::SeqCst);
        queue.requeue_front(drained).unwrap();
        queue.tree.insert(reserved.to_be_bytes(), entry(2)).unwrap();

        assert_eq!(queue.len().unwrap(), 2);
        assert_eq!(as_numbers(&drain(&queue).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_sled_repeated_requeues_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_temp_queue(&dir);
        for n in 1..=4 {
            queue.append(&entry(n)).unwrap();
        }
        let first = drain(&queue).unwrap();
        queue.requeue_front(first).unwrap();
        queue.append(&entry(5)).unwrap();
        let second = drain(&queue).unwrap();
        queue.requeue_front(second).unwrap();

        assert_eq!(as_numbers(&drain(&queue).unwrap()), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_blocking_helpers_round_trip() {
        let queue: Arc<dyn ReadingQueue> = Arc::new(MemoryQueue::new());
        append_blocking(&queue, entry(1)).await.unwrap();
        append_blocking(&queue, entry(2)).await.unwrap();

        let drained = drain_blocking(&queue).await.unwrap();
        assert_eq!(as_numbers(&drained), vec![1, 2]);
        assert!(queue.is_empty().unwrap());

        requeue_front_blocking(&queue, drained).await.unwrap();
        assert_eq!(as_numbers(&drain_blocking(&queue).await.unwrap()), vec![1, 2]);
    }

    fn assert_concurrent_appends_are_conserved(queue: Arc<dyn ReadingQueue>) {
        const TOTAL: u32 = 500;

        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            for n in 0..TOTAL {
                producer_queue.append(&entry(n)).unwrap();
            }
        });

        let mut drained = Vec::new();
        while !producer.is_finished() {
            drained.extend(drain(queue.as_ref()).unwrap());
        }
        producer.join().unwrap();
        let remaining = queue.len().unwrap();
        assert_eq!(drained.len() + remaining, TOTAL as usize);

        drained.extend(drain(queue.as_ref()).unwrap());
        assert_eq!(as_numbers(&drained), (0..TOTAL).collect::<Vec<_>>());
    }

    #[test]
    fn test_memory_queue_conserves_entries_under_concurrent_drains() {
        assert_concurrent_appends_are_conserved(Arc::new(MemoryQueue::new()));
    }

    #[test]
    fn test_sled_queue_conserves_entries_under_concurrent_drains() {
        let dir = tempfile::tempdir().unwrap();
        assert_concurrent_appends_are_conserved(Arc::new(open_temp_queue(&dir)));
    }
}
