//! Round-robin hand out of queue keys to concurrent progress callers.
use crossbeam::queue::SegQueue;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates a fixed set of keys FIFO. A key returned by `next` is owned by the caller until it
/// is handed back through `finish`, so two callers never work on the same key at once and
/// every key is visited once before any key is visited again.
pub struct ProgressTracker<K> {
    available: SegQueue<K>,
    total: usize,
    busy: AtomicUsize,
}

impl<K> ProgressTracker<K> {
    pub fn new<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
    {
        let available = SegQueue::new();
        let mut total = 0;

        for key in keys {
            available.push(key);
            total += 1;
        }

        Self {
            available,
            total,
            busy: AtomicUsize::new(0),
        }
    }

    pub fn can_progress(&self) -> bool {
        !self.available.is_empty()
    }

    pub fn next(&self) -> Option<K> {
        let key = self.available.pop()?;
        self.busy.fetch_add(1, Ordering::SeqCst);
        Some(key)
    }

    pub fn finish(&self, key: K) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
        self.available.push(key);
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of keys currently handed out.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }
}

impl<K> Debug for ProgressTracker<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total", &self.total)
            .field("busy", &self.busy())
            .finish()
    }
}
