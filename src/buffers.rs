//! Freelist buffer pools for avoiding per-response allocation
//!
//! A simple bag of reusable buffers. Acquire returns a zeroed-length buffer
//! with its underlying capacity intact; release resets length to 0 and
//! returns it to the freelist. Shaped after the generic object-pool pattern
//! used by connection-pool implementations elsewhere in the ecosystem.

use std::sync::Mutex;

/// A simple freelist of reusable `Vec<u8>` buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    default_capacity: usize,
}

impl BufferPool {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            default_capacity,
        }
    }

    /// Acquires a zeroed-length buffer with at least `default_capacity`
    /// capacity, reusing a freed one when available.
    pub fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        free.pop().unwrap_or_else(|| Vec::with_capacity(self.default_capacity))
    }

    /// Returns `buf` to the pool, resetting its length to zero but keeping
    /// its allocated capacity.
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().unwrap();
        free.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_reuses_capacity() {
        let pool = BufferPool::new(64);
        let mut buf = pool.acquire();
        assert!(buf.capacity() >= 64);
        buf.extend_from_slice(b"hello");
        let cap = buf.capacity();
        pool.release(buf);

        let reused = pool.acquire();
        assert_eq!(reused.len(), 0);
        assert!(reused.capacity() >= cap || reused.capacity() >= 64);
    }
}
