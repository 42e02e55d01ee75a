//! Reusable scratch buffers for copying a fetched segment's bytes before
//! they're frozen into the `Bytes` handed to the slot table, so a stream
//! of segment fetches doesn't allocate a fresh `Vec` per segment.

use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Acquire a buffer with at least `min_capacity` bytes of capacity,
    /// reusing a freed one if large enough; otherwise doubles the largest
    /// available buffer's capacity or allocates fresh.
    pub fn acquire(&self, min_capacity: usize) -> PooledBuffer {
        let mut free = self.free.lock().unwrap();
        let mut buf = match free
            .iter()
            .position(|b| b.capacity() >= min_capacity)
            .map(|i| free.swap_remove(i))
        {
            Some(buf) => buf,
            None => Vec::with_capacity(min_capacity.max(1).next_power_of_two()),
        };
        buf.clear();
        PooledBuffer {
            buf: Some(buf),
            pool: self.free.clone(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A `Vec<u8>` borrowed from a `BufferPool`, returned automatically on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.lock().unwrap().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffer_capacity() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.acquire(64);
            buf.extend_from_slice(&[1, 2, 3]);
        }
        let buf = pool.acquire(32);
        assert!(buf.capacity() >= 32);
        assert!(pool.free.lock().unwrap().is_empty());
    }

    #[test]
    fn clears_contents_on_reacquire() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.acquire(16);
            buf.extend_from_slice(b"stale");
        }
        let buf = pool.acquire(16);
        assert!(buf.is_empty());
    }
}
