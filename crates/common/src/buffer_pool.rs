//! Buffer pooling for the stream relay.
//!
//! Every relayed connection needs two copy buffers for its lifetime. This
//! module keeps released buffers around so steady-state traffic does not
//! allocate: a small thread-local cache is tried first, then a shared
//! bounded overflow list, and only then a fresh allocation.
//!
//! # Performance
//!
//! - Thread-local hits: no locking
//! - Shared overflow: one short `parking_lot` critical section
//! - Pool full: the buffer is freed instead of retained

use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Default buffer size (32 KB).
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Maximum number of buffers cached per thread.
pub const MAX_LOCAL_BUFFERS: usize = 4;

/// Default bound on the shared overflow list.
pub const DEFAULT_MAX_SHARED: usize = 256;

thread_local! {
    static LOCAL_BUFFERS: RefCell<Vec<Box<[u8]>>> =
        RefCell::new(Vec::with_capacity(MAX_LOCAL_BUFFERS));
}

/// Pool of fixed-size byte buffers.
///
/// Shared by reference (`Arc<BufferPool>`) between all connection handlers.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_shared: usize,
    shared: Mutex<Vec<Box<[u8]>>>,
    allocated: AtomicUsize,
    reused: AtomicUsize,
    dropped: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out buffers of exactly `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self::with_limits(buffer_size, DEFAULT_MAX_SHARED)
    }

    /// Create a pool with an explicit bound on the shared overflow list.
    pub fn with_limits(buffer_size: usize, max_shared: usize) -> Self {
        Self {
            buffer_size,
            max_shared,
            shared: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Size of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer from the pool, allocating if none is free.
    ///
    /// The buffer goes back to the pool when the guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self.take_local().or_else(|| self.shared.lock().pop());

        let buffer = match buffer {
            Some(buffer) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                trace!(size = self.buffer_size, "Allocating relay buffer");
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    fn take_local(&self) -> Option<Box<[u8]>> {
        LOCAL_BUFFERS.with(|local| {
            let mut local = local.borrow_mut();
            let idx = local.iter().position(|b| b.len() == self.buffer_size)?;
            Some(local.swap_remove(idx))
        })
    }

    fn release(&self, buffer: Box<[u8]>) {
        // Thread-local first
        let overflow = LOCAL_BUFFERS.with(|local| {
            let mut local = local.borrow_mut();
            if local.len() < MAX_LOCAL_BUFFERS {
                local.push(buffer);
                None
            } else {
                Some(buffer)
            }
        });

        let Some(buffer) = overflow else {
            return;
        };

        let mut shared = self.shared.lock();
        if shared.len() < self.max_shared {
            shared.push(buffer);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            shared: self.shared.lock().len(),
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// A pooled buffer that returns to its pool on drop.
pub struct PooledBuffer {
    buffer: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Buffer length (always the pool's buffer size).
    #[inline]
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    /// Whether the buffer has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_ref().is_empty()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// Buffer pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently parked in the shared overflow list.
    pub shared: usize,
    /// Total buffers allocated (lifetime).
    pub allocated: usize,
    /// Total buffers reused from the pool (lifetime).
    pub reused: usize,
    /// Total buffers freed because the pool was full.
    pub dropped: usize,
}

impl PoolStats {
    /// Calculate the hit rate (reused / (allocated + reused)).
    pub fn hit_rate(&self) -> f64 {
        let total = self.allocated + self.reused;
        if total == 0 {
            0.0
        } else {
            self.reused as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each #[test] runs on its own thread, so the thread-local cache starts empty.

    #[test]
    fn test_buffer_has_pool_size() {
        let pool = Arc::new(BufferPool::new(1024));
        let mut buf = pool.acquire();

        assert_eq!(buf.len(), 1024);
        buf[..5].copy_from_slice(b"hello");
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_default_size_is_32k() {
        let pool = Arc::new(BufferPool::default());
        assert_eq!(pool.acquire().len(), 32 * 1024);
    }

    #[test]
    fn test_buffer_reuse() {
        let pool = Arc::new(BufferPool::new(1024));

        drop(pool.acquire());
        drop(pool.acquire());

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
    }

    #[test]
    fn test_overflow_goes_to_shared_list() {
        let pool = Arc::new(BufferPool::new(512));

        let buffers: Vec<_> = (0..MAX_LOCAL_BUFFERS + 3).map(|_| pool.acquire()).collect();
        drop(buffers);

        let stats = pool.stats();
        assert_eq!(stats.allocated, MAX_LOCAL_BUFFERS + 3);
        assert_eq!(stats.shared, 3);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn test_full_pool_drops_buffers() {
        let pool = Arc::new(BufferPool::with_limits(256, 2));

        let buffers: Vec<_> = (0..MAX_LOCAL_BUFFERS + 5).map(|_| pool.acquire()).collect();
        drop(buffers);

        let stats = pool.stats();
        assert_eq!(stats.shared, 2);
        assert_eq!(stats.dropped, 3);
    }

    #[test]
    fn test_shared_buffers_cross_threads() {
        let pool = Arc::new(BufferPool::with_limits(128, 16));

        let worker = Arc::clone(&pool);
        std::thread::spawn(move || {
            let buffers: Vec<_> = (0..MAX_LOCAL_BUFFERS + 2).map(|_| worker.acquire()).collect();
            drop(buffers);
        })
        .join()
        .unwrap();

        // Two buffers overflowed into the shared list and are visible here
        let _a = pool.acquire();
        let _b = pool.acquire();
        let stats = pool.stats();
        assert_eq!(stats.reused, 2);
        assert_eq!(stats.shared, 0);
    }

    #[test]
    fn test_local_cache_ignores_other_sizes() {
        let small = Arc::new(BufferPool::new(64));
        let large = Arc::new(BufferPool::new(4096));

        drop(small.acquire());
        let buf = large.acquire();

        assert_eq!(buf.len(), 4096);
        assert_eq!(large.stats().allocated, 1);
        assert_eq!(large.stats().reused, 0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = PoolStats {
            shared: 5,
            allocated: 10,
            reused: 90,
            dropped: 0,
        };

        assert!((stats.hit_rate() - 0.9).abs() < 0.01);
    }
}
