//! Packet buffer pool and reference-counted packet leases.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Shared pool of reusable packet buffers.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_buffers: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// Buffers are allocated on demand and at most `max_buffers` idle buffers are retained.
    #[must_use]
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be positive");
        assert!(max_buffers > 0, "max_buffers must be positive");

        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::with_capacity(max_buffers.min(1024))),
                buffer_size,
                max_buffers,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquire an empty buffer from the pool.
    pub fn acquire(&self) -> Buffer {
        let data = self
            .inner
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buffer_size));
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);

        Buffer {
            data: Some(data),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Copy `bytes` into a pooled buffer and freeze it.
    pub fn rent_from(&self, bytes: &[u8]) -> RentMemory {
        let mut buffer = self.acquire();
        buffer.data_mut().extend_from_slice(bytes);
        buffer.freeze()
    }

    /// Buffer capacity in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Maximum number of idle buffers retained by the pool.
    #[must_use]
    pub fn max_buffers(&self) -> usize {
        self.inner.max_buffers
    }

    /// Idle buffers currently held by the pool.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    /// Buffers currently leased out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }
}

/// Buffer leased from the pool.
pub struct Buffer {
    data: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl Buffer {
    /// Growable view for writes; the lease keeps its allocation when returned.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        self.data.get_or_insert_with(Vec::new)
    }

    /// Expose the filled portion of the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Current length of the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Check whether the buffer contains no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze into a shareable, reference-counted packet.
    #[must_use]
    pub fn freeze(self) -> RentMemory {
        RentMemory {
            inner: Arc::new(self),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(mut data) = self.data.take() {
            self.pool.outstanding.fetch_sub(1, Ordering::Relaxed);
            data.clear();
            let mut guard = self.pool.buffers.lock();
            if guard.len() < self.pool.max_buffers {
                guard.push(data);
            }
        }
    }
}

/// Immutable packet shared by the gene that owns it and any in-flight send.
///
/// The underlying buffer returns to its pool when the last holder drops it.
#[derive(Clone, Debug)]
pub struct RentMemory {
    inner: Arc<Buffer>,
}

impl RentMemory {
    /// Hand out another reference to the same packet.
    #[must_use]
    pub fn increment_and_share(&self) -> Self {
        self.clone()
    }

    /// Number of live references.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Packet bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl Deref for RentMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for RentMemory {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
