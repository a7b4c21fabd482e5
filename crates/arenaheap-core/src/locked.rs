//! Single coarse lock around a heap.
//!
//! The heaps themselves take `&mut self` and have no internal locking. Wrap
//! one in [`LockedHeap`] to share it: every operation holds the lock for its
//! full duration, including the accounting queries.

use parking_lot::Mutex;

use crate::heap::{ArenaAllocator, HeapStats};

pub struct LockedHeap<H> {
    inner: Mutex<H>,
}

impl<H: ArenaAllocator> LockedHeap<H> {
    #[must_use]
    pub fn new(heap: H) -> Self {
        Self {
            inner: Mutex::new(heap),
        }
    }

    pub fn allocate(&self, size: usize) -> Option<H::Block> {
        self.inner.lock().allocate(size)
    }

    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<H::Block> {
        self.inner.lock().allocate_aligned(size, align)
    }

    /// # Safety
    ///
    /// Same contract as [`ArenaAllocator::release`].
    #[allow(unsafe_code)]
    pub unsafe fn release(&self, block: H::Block) {
        // SAFETY: forwarded contract.
        unsafe { self.inner.lock().release(block) }
    }

    #[must_use]
    pub fn max_free_block(&self) -> usize {
        self.inner.lock().max_free_block()
    }

    #[must_use]
    pub fn bytes_available(&self, net: bool) -> usize {
        self.inner.lock().bytes_available(net)
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.inner.lock().bytes_allocated()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    /// Run `f` with the lock held, for compound operations and variant
    /// specific calls.
    pub fn with<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn into_inner(self) -> H {
        self.inner.into_inner()
    }
}
