//! Reference-counted handle over a recyclable resource.
//!
//! `Shared<T>` is the ownership model for pooled payloads: cloning a handle
//! adds a holder, dropping one removes it, and when the last holder goes away
//! the resource is handed back to its [`Recycler`] instead of being freed.
//! The holder count is the strong count of the inner `Arc`; the return-to-pool
//! callback is the inner value's `Drop`, so it runs exactly once.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;

/// Return path for a resource whose last holder has gone.
pub trait Recycler<T>: Send + Sync {
    /// Take back a resource no handle refers to any more.
    fn recycle(&self, resource: T);

    /// Produce an independent copy of `resource` for copy-on-write.
    fn duplicate(&self, resource: &T) -> T;
}

struct SharedInner<T> {
    resource: ManuallyDrop<T>,
    recycler: Arc<dyn Recycler<T>>,
}

impl<T> Drop for SharedInner<T> {
    fn drop(&mut self) {
        // SAFETY: `resource` is taken exactly once, here, and never touched again.
        let resource = unsafe { ManuallyDrop::take(&mut self.resource) };
        self.recycler.recycle(resource);
    }
}

/// Shared, immutable-by-default handle to a pooled resource.
pub struct Shared<T> {
    inner: Arc<SharedInner<T>>,
}

impl<T> Shared<T> {
    pub fn new(resource: T, recycler: Arc<dyn Recycler<T>>) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                resource: ManuallyDrop::new(resource),
                recycler,
            }),
        }
    }

    /// Number of live handles referring to the resource.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_unique(&self) -> bool {
        self.holders() == 1
    }

    /// Mutable access, only while this is the sole handle.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        Arc::get_mut(&mut self.inner).map(|inner| &mut *inner.resource)
    }

    /// Mutable access, copying the resource into a fresh one first if other
    /// handles still refer to it.
    pub fn make_mut(&mut self) -> &mut T {
        if Arc::get_mut(&mut self.inner).is_none() {
            let recycler = Arc::clone(&self.inner.recycler);
            let copy = recycler.duplicate(&self.inner.resource);
            *self = Shared::new(copy, recycler);
        }
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => &mut *inner.resource,
            None => unreachable!("freshly duplicated handle is unique"),
        }
    }

    /// Give up this holder's reference. Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self);
    }

    /// Whether two handles refer to the same resource.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.resource
    }
}

impl<T> AsRef<T> for Shared<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("holders", &self.holders())
            .field("resource", &**self)
            .finish()
    }
}
