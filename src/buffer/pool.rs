use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Buffer;
use crate::prelude::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("released more buffers than the pool owns ({capacity})")]
    Overflow { capacity: usize },

    #[error("buffer of {found} bytes does not belong to a pool of {expected} byte buffers")]
    ForeignBuffer { expected: usize, found: usize },
}

/// Bounded pool of equally sized buffers. Safe for concurrent acquire/release.
///
/// An empty pool is backpressure: `acquire` returns `None` and the caller retries later.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Buffer>,
    count: usize,
    buffer_size: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let buffers = ArrayQueue::new(max(count, 1));
        for _ in 0..count {
            let _ = buffers.push(Buffer::new(buffer_size));
        }

        Self {
            buffers,
            count,
            buffer_size,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> Option<Buffer> {
        let buffer = self.buffers.pop()?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Some(buffer)
    }

    /// Takes `n` buffers at once, or none at all when fewer than `n` are available. Callers
    /// that need several buffers for one message use this so that two partial fills can never
    /// split the pool between them.
    pub fn acquire_many(&self, n: usize) -> Option<Vec<Buffer>> {
        let mut taken = Vec::with_capacity(n);

        while taken.len() < n {
            match self.buffers.pop() {
                Some(buffer) => taken.push(buffer),
                None => break,
            }
        }

        if taken.len() < n {
            for buffer in taken {
                let _ = self.buffers.push(buffer);
            }
            return None;
        }

        self.acquired.fetch_add(n, Ordering::SeqCst);
        Some(taken)
    }

    pub fn release(&self, mut buffer: Buffer) -> Result<(), PoolError> {
        if buffer.capacity() != self.buffer_size {
            return Err(PoolError::ForeignBuffer {
                expected: self.buffer_size,
                found: buffer.capacity(),
            });
        }

        buffer.clear();
        self.buffers.push(buffer).map_err(|_| PoolError::Overflow {
            capacity: self.buffers.capacity(),
        })?;

        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Number of buffers owned by the pool.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Number of buffers handed out so far.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Number of buffers given back so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> usize {
        self.acquired() - self.released()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pool_exhaustion() {
        let pool = BufferPool::new(2, 16);
        let a = pool.acquire().unwrap();
        let mut b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 2);

        b.write(b"payload");
        pool.release(b).unwrap();

        // Released buffers come back cleared.
        let c = pool.acquire().unwrap();
        assert!(c.is_empty());

        pool.release(a).unwrap();
        pool.release(c).unwrap();
        assert_eq!(pool.acquired(), pool.released());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_acquire_many_is_all_or_nothing() {
        let pool = BufferPool::new(3, 16);
        let held = pool.acquire().unwrap();

        assert!(pool.acquire_many(3).is_none());
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.acquired(), 1);

        let two = pool.acquire_many(2).unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_use(), 3);

        pool.release(held).unwrap();
        for buffer in two {
            pool.release(buffer).unwrap();
        }
        assert_eq!(pool.acquired(), pool.released());
        assert_eq!(pool.count(), 3);
    }

    #[test]
    fn test_pool_rejects_invalid_release() {
        let pool = BufferPool::new(1, 16);
        assert_eq!(
            pool.release(Buffer::new(16)),
            Err(PoolError::Overflow { capacity: 1 })
        );
        assert_eq!(
            pool.release(Buffer::new(32)),
            Err(PoolError::ForeignBuffer {
                expected: 16,
                found: 32
            })
        );
        assert_eq!(pool.released(), 0);
    }
}
