//! Payload ownership: inline buffers and the shared byte-buffer pool.
//!
//! Small payloads are copied into a fixed inline array inside the packet;
//! larger payloads rent a buffer from a process-wide [`BufferPool`] and
//! return it exactly once when dropped. Ownership is exclusive: cloning a
//! payload clones the bytes (renting a fresh pooled buffer when needed).

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicIsize, Ordering},
};

use crate::{MAX_PAYLOAD_SIZE, ProtocolError, Result};

/// Largest payload stored inline inside a packet, in bytes.
pub const INLINE_CAPACITY: usize = 128;

/// Shared pool of payload-sized byte buffers.
///
/// Rent/return must stay balanced; the `outstanding` counter asserts that
/// in debug builds. Buffers returned while the pool is full are dropped
/// instead of retained, so the pool never grows past `max_pooled`.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_pooled: usize,
    outstanding: AtomicIsize,
}

impl BufferPool {
    /// Default number of retained buffers.
    pub const DEFAULT_MAX_POOLED: usize = 256;

    /// Create a pool of buffers with the given per-buffer capacity.
    #[must_use]
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            buffer_capacity,
            max_pooled,
            outstanding: AtomicIsize::new(0),
        })
    }

    /// Pool sized for full packet payloads.
    #[must_use]
    pub fn with_defaults() -> Arc<Self> {
        Self::new(MAX_PAYLOAD_SIZE, Self::DEFAULT_MAX_POOLED)
    }

    /// Rent a buffer holding a copy of `data`.
    pub fn rent(self: &Arc<Self>, data: &[u8]) -> PooledBuf {
        let mut buf = {
            let mut free = self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            free.pop().unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity))
        };
        buf.clear();
        buf.extend_from_slice(data);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuf { data: Some(buf), pool: Arc::clone(self) }
    }

    fn recycle(&self, mut buf: Vec<u8>) {
        let prior = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prior > 0, "buffer returned more often than rented");

        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    /// Buffers currently rented out.
    #[must_use]
    pub fn outstanding(&self) -> isize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers currently idle in the pool.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("max_pooled", &self.max_pooled)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Exclusive handle to a rented pool buffer.
///
/// The buffer is returned to its pool exactly once, on drop. Cloning rents
/// a fresh buffer from the same pool and copies the bytes.
pub struct PooledBuf {
    data: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Bytes held by this handle.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl Clone for PooledBuf {
    fn clone(&self) -> Self {
        self.pool.rent(self.as_slice())
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take() {
            self.pool.recycle(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.as_slice().len()).finish()
    }
}

/// Owned packet payload: inline for small payloads, pooled above
/// [`INLINE_CAPACITY`].
#[derive(Debug, Clone)]
pub enum PayloadBuf {
    /// Payload stored inside the packet value.
    Inline {
        /// Number of valid bytes in `data`.
        len: u8,
        /// Inline storage.
        data: Box<[u8; INLINE_CAPACITY]>,
    },
    /// Payload rented from a [`BufferPool`].
    Pooled(PooledBuf),
}

impl PayloadBuf {
    /// Empty payload.
    #[must_use]
    pub fn empty() -> Self {
        Self::Inline { len: 0, data: Box::new([0u8; INLINE_CAPACITY]) }
    }

    /// Copy `bytes` into an owned payload, renting from `pool` when the
    /// payload exceeds the inline threshold.
    ///
    /// # Errors
    ///
    /// `ProtocolError::PayloadTooLarge` above
    /// [`MAX_PAYLOAD_SIZE`](crate::MAX_PAYLOAD_SIZE).
    pub fn copy_from(bytes: &[u8], pool: &Arc<BufferPool>) -> Result<Self> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size: bytes.len(), max: MAX_PAYLOAD_SIZE });
        }

        if bytes.len() <= INLINE_CAPACITY {
            let mut data = Box::new([0u8; INLINE_CAPACITY]);
            data[..bytes.len()].copy_from_slice(bytes);
            Ok(Self::Inline { len: bytes.len() as u8, data })
        } else {
            Ok(Self::Pooled(pool.rent(bytes)))
        }
    }

    /// Payload bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Inline { len, data } => &data[..*len as usize],
            Self::Pooled(buf) => buf.as_slice(),
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialEq for PayloadBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PayloadBuf {}
