//! Size-classed free-list pool for large payload buffers.
//!
//! Blocks are bucketed by power-of-two capacity (at least
//! [`MIN_BLOCK_SIZE`] bytes). `acquire` pops a free block of the requested
//! class or allocates a new one; when the last [`Shared`] handle to a block is
//! dropped the block goes back on its class's free list. Blocks are not
//! zeroed on reuse: the writer owns a buffer until it shares it.

use crate::buffer::shared::{Recycler, Shared};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Smallest block handed out by the pool.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Power-of-two capacity bucket, stored as its base-2 exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    /// Class whose blocks hold at least `len` bytes.
    pub fn for_len(len: usize) -> Self {
        let capacity = len
            .max(MIN_BLOCK_SIZE)
            .checked_next_power_of_two()
            .unwrap_or(1 << (usize::BITS - 1));
        Self(capacity.trailing_zeros() as u8)
    }

    pub fn capacity(self) -> usize {
        1usize << self.0
    }
}

/// A fixed-capacity byte block with a logical length.
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    class: SizeClass,
}

impl Buffer {
    fn allocate(class: SizeClass) -> Self {
        Self {
            data: vec![0u8; class.capacity()].into_boxed_slice(),
            len: 0,
            class,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn size_class(&self) -> SizeClass {
        self.class
    }

    /// Set the logical length, clamped to capacity. Returns the new length.
    pub fn set_len(&mut self, len: usize) -> usize {
        self.len = len.min(self.capacity());
        self.len
    }

    /// Overwrite the contents with `src`, truncating to capacity. Returns the
    /// number of bytes copied.
    pub fn write_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.capacity());
        self.data[..n].copy_from_slice(&src[..n]);
        self.len = n;
        n
    }

    /// Address of the backing storage; stable across recycling.
    pub fn storage_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Pool counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Blocks allocated by the pool and not yet released by `shrink`.
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    /// Blocks sitting on free lists.
    pub available_blocks: usize,
    /// Blocks currently referenced by at least one handle.
    pub outstanding: usize,
    /// Acquisitions served from a free list.
    pub reused: u64,
    /// Free blocks per size class, by capacity in bytes.
    pub available_by_class: BTreeMap<usize, usize>,
}

#[derive(Default)]
struct PoolInner {
    free: Mutex<BTreeMap<SizeClass, Vec<Buffer>>>,
    allocated_blocks: AtomicUsize,
    allocated_bytes: AtomicUsize,
    outstanding: AtomicUsize,
    reused: AtomicU64,
}

impl PoolInner {
    fn take(&self, class: SizeClass) -> Buffer {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&class)
            .and_then(Vec::pop);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        match recycled {
            Some(buffer) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.allocated_blocks.fetch_add(1, Ordering::Relaxed);
                self.allocated_bytes
                    .fetch_add(class.capacity(), Ordering::Relaxed);
                tracing::trace!("Pool allocated a {} byte block", class.capacity());
                Buffer::allocate(class)
            }
        }
    }
}

impl Recycler<Buffer> for PoolInner {
    fn recycle(&self, mut buffer: Buffer) {
        buffer.len = 0;
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(buffer.class)
            .or_default()
            .push(buffer);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn duplicate(&self, source: &Buffer) -> Buffer {
        let mut copy = self.take(source.class);
        copy.write_from(source);
        copy
    }
}

/// Process-wide or injected pool of reusable byte blocks.
///
/// Cloning a `BufferPool` yields another handle to the same free lists.
#[derive(Clone, Default)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lazily created process-wide pool.
    pub fn global() -> &'static BufferPool {
        static GLOBAL: OnceLock<BufferPool> = OnceLock::new();
        GLOBAL.get_or_init(BufferPool::new)
    }

    /// A buffer of logical length `len`, unique to the caller.
    ///
    /// The contents of a recycled block are whatever its previous writer left.
    pub fn acquire(&self, len: usize) -> Shared<Buffer> {
        let mut buffer = self.inner.take(SizeClass::for_len(len));
        buffer.set_len(len);
        self.wrap(buffer)
    }

    /// A buffer holding a copy of `bytes`.
    pub fn acquire_from(&self, bytes: &[u8]) -> Shared<Buffer> {
        let mut buffer = self.inner.take(SizeClass::for_len(bytes.len()));
        buffer.write_from(bytes);
        self.wrap(buffer)
    }

    fn wrap(&self, buffer: Buffer) -> Shared<Buffer> {
        let recycler: Arc<dyn Recycler<Buffer>> = self.inner.clone();
        Shared::new(buffer, recycler)
    }

    /// Number of free blocks able to serve a request of `len` bytes.
    pub fn available(&self, len: usize) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&SizeClass::for_len(len))
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> PoolStats {
        let free = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let available_by_class: BTreeMap<usize, usize> = free
            .iter()
            .filter(|(_, blocks)| !blocks.is_empty())
            .map(|(class, blocks)| (class.capacity(), blocks.len()))
            .collect();
        PoolStats {
            allocated_blocks: self.inner.allocated_blocks.load(Ordering::Relaxed),
            allocated_bytes: self.inner.allocated_bytes.load(Ordering::Relaxed),
            available_blocks: available_by_class.values().sum(),
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            reused: self.inner.reused.load(Ordering::Relaxed),
            available_by_class,
        }
    }

    /// Free every block on the free lists. Returns the bytes released.
    pub fn shrink(&self) -> usize {
        let drained = std::mem::take(
            &mut *self
                .inner
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let (blocks, bytes) = drained
            .values()
            .flatten()
            .fold((0, 0), |(n, b), buf| (n + 1, b + buf.capacity()));
        self.inner.allocated_blocks.fetch_sub(blocks, Ordering::Relaxed);
        self.inner.allocated_bytes.fetch_sub(bytes, Ordering::Relaxed);
        if bytes > 0 {
            tracing::debug!("Pool shrink released {} blocks ({} bytes)", blocks, bytes);
        }
        bytes
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}
