//! Heap variants and the types they share.
//!
//! Both variants run the same placement and coalescing logic
//! (`engine::HeapCore`); they differ only in how headers and index links are
//! stored in the arena.

mod engine;
#[allow(unsafe_code)]
pub mod native;
pub mod relocatable;

use serde::Serialize;

pub use native::NativeHeap;
pub use relocatable::RelocatableHeap;

/// Role of a span in the arena memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// The record written by init; never released.
    Bootstrap,
    /// Header, padding and payload of a live allocation.
    Allocated,
    /// Free space trailing the preceding span.
    Free,
}

/// One entry of [`NativeHeap::spans`] / [`RelocatableHeap::spans`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpanInfo {
    pub kind: SpanKind,
    /// Offset from the arena start.
    pub offset: usize,
    pub len: usize,
    /// Diagnostic tag of an allocated span, if one was recorded.
    pub tag: Option<u32>,
}

/// Accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeapStats {
    pub arena_size: usize,
    pub header_size: usize,
    pub bootstrap_size: usize,
    /// Sum of all span sizes in the address index, bootstrap included.
    pub bytes_allocated: usize,
    /// Sum of all free block sizes.
    pub bytes_available: usize,
    /// Same, less one header per free block.
    pub bytes_available_net: usize,
    pub max_free_block: usize,
    pub live_allocations: usize,
    pub free_blocks: usize,
    /// Number of nodes in the free index (one per distinct free size).
    pub distinct_free_sizes: usize,
}

/// Operations common to both heap variants.
///
/// An `align` of 0 or 1 requests no alignment beyond what the layout yields.
pub trait ArenaAllocator {
    /// Handle returned for a live allocation.
    type Block: Copy;

    fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<Self::Block>;

    fn allocate(&mut self, size: usize) -> Option<Self::Block> {
        self.allocate_aligned(size, 0)
    }

    /// Return `block` to the heap.
    ///
    /// # Safety
    ///
    /// `block` must come from this heap and must not have been released yet.
    #[allow(unsafe_code)]
    unsafe fn release(&mut self, block: Self::Block);

    fn max_free_block(&self) -> usize;
    fn bytes_available(&self, net: bool) -> usize;
    fn bytes_allocated(&self) -> usize;
    fn stats(&self) -> HeapStats;
}
