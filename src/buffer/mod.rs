//! Fixed-size reusable memory blocks used by the send and receive paths.
mod pool;

pub use self::pool::{BufferPool, PoolError};

use std::fmt::{self, Debug};

/// Owned fixed-capacity byte region. Only the first `size()` bytes hold data.
pub struct Buffer {
    data: Box<[u8]>,
    size: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Appends as many bytes of `bytes` as fit and returns how many were copied.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = std::cmp::min(bytes.len(), self.remaining());
        self.data[self.size..self.size + n].copy_from_slice(&bytes[..n]);
        self.size += n;
        n
    }

    /// Reserves the next `n` bytes and returns them for in-place writing.
    pub fn reserve(&mut self, n: usize) -> Option<&mut [u8]> {
        if n > self.remaining() {
            return None;
        }

        let start = self.size;
        self.size += n;
        Some(&mut self.data[start..start + n])
    }

    pub fn clear(&mut self) {
        self.size = 0;
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .finish()
    }
}
