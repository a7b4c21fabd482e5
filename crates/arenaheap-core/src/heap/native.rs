//! Heap over a raw arena using absolute addresses.
//!
//! Headers are packed structs written at arbitrary byte addresses inside the
//! arena, so every field access is an unaligned read or write. Index roots and
//! sentinels live in the heap object, outside the arena.

use std::mem::{offset_of, size_of};
use std::ptr::{self, NonNull};

use arenaheap_index::{IndexRead, IndexViolation, RbNode, RbTree};

use super::engine::{self, FreeRecord, HeapCore, SpanStore};
use super::{ArenaAllocator, HeapStats, SpanInfo};
use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult, IntegrityError};
use crate::log::HeapLogRecord;

#[repr(C, packed)]
struct FreeBlock {
    in_tree: bool,
    base: usize,
    size: usize,
    next: *mut FreeBlock,
    prev: *mut FreeBlock,
}

#[repr(C, packed)]
struct Header {
    abase: usize,
    asize: usize,
    tag: u32,
    fnode: RbNode,
    anode: RbNode,
    fblock: FreeBlock,
    padding: u32,
}

/// Bytes of metadata in front of every payload.
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Size of the bootstrap span at the start of the arena.
pub const BOOTSTRAP_SIZE: usize = HEADER_SIZE;

const FNODE: usize = offset_of!(Header, fnode);
const ANODE: usize = offset_of!(Header, anode);
const FBLOCK: usize = offset_of!(Header, fblock);

macro_rules! load {
    ($span:expr, $($field:ident).+) => {
        // SAFETY: `$span` addresses a header inside the arena; see `NativeStore`.
        unsafe { (&raw const (*$span.as_ptr()).$($field).+).read_unaligned() }
    };
}

macro_rules! store {
    ($span:expr, $($field:ident).+, $value:expr) => {
        // SAFETY: see `load!`.
        unsafe { (&raw mut (*$span.as_ptr()).$($field).+).write_unaligned($value) }
    };
}

/// Arena bookkeeping.
///
/// Invariant: `base..base + size` is valid for reads and writes for the life
/// of the store and is accessed by nothing else. Every `NonNull<Header>` the
/// store hands out lies at least `HEADER_SIZE` bytes before the arena end.
struct NativeStore {
    base: NonNull<u8>,
    size: usize,
    free: RbTree,
    addr: RbTree,
}

impl NativeStore {
    #[inline]
    fn at(&self, addr: usize) -> NonNull<u8> {
        let off = addr - self.base.as_ptr() as usize;
        debug_assert!(off <= self.size);
        // SAFETY: `off` is within the arena (checked by every caller).
        unsafe { self.base.add(off) }
    }

    #[inline]
    fn fnode(span: NonNull<Header>) -> NonNull<RbNode> {
        // SAFETY: field projection inside the header allocation.
        unsafe { span.cast::<u8>().add(FNODE).cast() }
    }

    #[inline]
    fn anode(span: NonNull<Header>) -> NonNull<RbNode> {
        // SAFETY: as above.
        unsafe { span.cast::<u8>().add(ANODE).cast() }
    }

    #[inline]
    fn fblock(span: NonNull<Header>) -> *mut FreeBlock {
        // SAFETY: as above.
        unsafe { span.cast::<u8>().add(FBLOCK).cast::<FreeBlock>().as_ptr() }
    }

    #[inline]
    fn from_fnode(node: NonNull<RbNode>) -> NonNull<Header> {
        // SAFETY: free-index nodes are only ever embedded `fnode` fields.
        unsafe { node.cast::<u8>().sub(FNODE).cast() }
    }

    #[inline]
    fn from_anode(node: NonNull<RbNode>) -> NonNull<Header> {
        // SAFETY: address-index nodes are only ever embedded `anode` fields.
        unsafe { node.cast::<u8>().sub(ANODE).cast() }
    }

    #[inline]
    fn from_fblock(block: *mut FreeBlock) -> Option<NonNull<Header>> {
        // SAFETY: chain links only ever point at embedded `fblock` fields.
        NonNull::new(block).map(|b| unsafe { b.cast::<u8>().sub(FBLOCK).cast() })
    }
}

impl SpanStore for NativeStore {
    type Span = NonNull<Header>;

    const VARIANT: &'static str = "native";
    const HEADER_SIZE: usize = HEADER_SIZE;
    const BOOTSTRAP_SIZE: usize = BOOTSTRAP_SIZE;
    const MAX_SPAN: usize = isize::MAX as usize;

    fn arena_start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn arena_size(&self) -> usize {
        self.size
    }

    fn bootstrap(&self) -> NonNull<Header> {
        self.base.cast()
    }

    fn span_at(&self, addr: usize) -> NonNull<Header> {
        self.at(addr).cast()
    }

    fn abase(&self, span: NonNull<Header>) -> usize {
        load!(span, abase)
    }

    fn asize(&self, span: NonNull<Header>) -> usize {
        load!(span, asize)
    }

    fn tag(&self, span: NonNull<Header>) -> u32 {
        load!(span, tag)
    }

    fn write_header(&mut self, span: NonNull<Header>, abase: usize, asize: usize, tag: u32) {
        store!(span, abase, abase);
        store!(span, asize, asize);
        store!(span, tag, tag);
        self.set_free_record(span, &FreeRecord::empty(abase + asize));
    }

    fn free_record(&self, span: NonNull<Header>) -> FreeRecord<NonNull<Header>> {
        FreeRecord {
            in_tree: load!(span, fblock.in_tree),
            base: load!(span, fblock.base),
            size: load!(span, fblock.size),
            next: Self::from_fblock(load!(span, fblock.next)),
            prev: Self::from_fblock(load!(span, fblock.prev)),
        }
    }

    fn set_free_record(&mut self, span: NonNull<Header>, rec: &FreeRecord<NonNull<Header>>) {
        let link = |s: Option<NonNull<Header>>| s.map_or(ptr::null_mut(), Self::fblock);
        store!(span, fblock.in_tree, rec.in_tree);
        store!(span, fblock.base, rec.base);
        store!(span, fblock.size, rec.size);
        store!(span, fblock.next, link(rec.next));
        store!(span, fblock.prev, link(rec.prev));
    }

    fn padding(&self, payload: usize) -> u32 {
        let word = self.at(payload - 4).cast::<u32>();
        // SAFETY: callers pass payloads at least a header past the arena start.
        unsafe { word.as_ptr().read_unaligned() }
    }

    fn set_padding(&mut self, payload: usize, padding: u32) {
        let word = self.at(payload - 4).cast::<u32>();
        // SAFETY: as above.
        unsafe { word.as_ptr().write_unaligned(padding) }
    }

    fn free_insert(&mut self, span: NonNull<Header>, size: usize) {
        // SAFETY: the node is embedded in a header inside the arena, which
        // outlives the tree.
        unsafe {
            self.free
                .insert(size as u64, Self::fblock(span).cast(), Self::fnode(span));
        }
    }

    fn free_delete(&mut self, span: NonNull<Header>) {
        // SAFETY: only representatives (records flagged in-tree) are deleted.
        unsafe { self.free.delete(Self::fnode(span)) };
    }

    fn free_key(&self, span: NonNull<Header>) -> usize {
        self.free.key(Self::fnode(span)) as usize
    }

    fn free_search(&self, size: usize) -> Option<NonNull<Header>> {
        self.free.search(size as u64).map(Self::from_fnode)
    }

    fn free_min_at_least(&self, size: usize) -> Option<NonNull<Header>> {
        self.free.min_at_least(size as u64).map(Self::from_fnode)
    }

    fn free_next_larger(&self, span: NonNull<Header>) -> Option<NonNull<Header>> {
        self.free
            .next_larger(Self::fnode(span))
            .map(Self::from_fnode)
    }

    fn free_max(&self) -> Option<NonNull<Header>> {
        self.free.max().map(Self::from_fnode)
    }

    fn for_each_free(&self, mut visit: impl FnMut(NonNull<Header>)) {
        self.free
            .for_each_in_order(|n| visit(Self::from_fnode(n)));
    }

    fn free_check(&self) -> Result<usize, IndexViolation> {
        self.free.check()
    }

    fn free_dot(&self) -> String {
        self.free.to_dot()
    }

    fn addr_insert(&mut self, span: NonNull<Header>) {
        let key = self.abase(span) as u64;
        // SAFETY: as for `free_insert`.
        unsafe {
            self.addr
                .insert(key, span.cast::<u8>().as_ptr(), Self::anode(span));
        }
    }

    fn addr_delete(&mut self, span: NonNull<Header>) {
        // SAFETY: callers only delete spans found through the address index.
        unsafe { self.addr.delete(Self::anode(span)) };
    }

    fn addr_prev(&self, span: NonNull<Header>) -> Option<NonNull<Header>> {
        self.addr
            .next_smaller(Self::anode(span))
            .map(Self::from_anode)
    }

    fn for_each_span(&self, mut visit: impl FnMut(NonNull<Header>)) {
        self.addr
            .for_each_in_order(|n| visit(Self::from_anode(n)));
    }

    fn addr_check(&self) -> Result<usize, IndexViolation> {
        self.addr.check()
    }

    fn addr_dot(&self) -> String {
        self.addr.to_dot()
    }
}

/// Heap over caller-owned memory, returning absolute payload pointers.
pub struct NativeHeap {
    core: HeapCore<NativeStore>,
}

// SAFETY: the heap exclusively manages its arena and owns both index
// sentinels; no pointer it holds is shared with another owner.
unsafe impl Send for NativeHeap {}

impl NativeHeap {
    /// Format `size` bytes at `arena` as an empty heap.
    ///
    /// # Safety
    ///
    /// `arena..arena + size` must be valid for reads and writes for as long
    /// as the heap and any payload pointer it returns are in use, and must
    /// not be accessed other than through those payload pointers.
    pub unsafe fn new(arena: NonNull<u8>, size: usize, config: HeapConfig) -> HeapResult<Self> {
        if size < BOOTSTRAP_SIZE {
            return Err(HeapError::ArenaTooSmall {
                size,
                min: BOOTSTRAP_SIZE,
            });
        }
        if size > isize::MAX as usize {
            return Err(HeapError::ArenaTooLarge {
                size,
                max: isize::MAX as usize,
            });
        }
        let store = NativeStore {
            base: arena,
            size,
            free: RbTree::new(),
            addr: RbTree::new(),
        };
        Ok(Self {
            core: HeapCore::format(store, config),
        })
    }

    /// Format a static buffer as an empty heap.
    pub fn from_static(arena: &'static mut [u8], config: HeapConfig) -> HeapResult<Self> {
        let size = arena.len();
        let base = NonNull::from(arena).cast::<u8>();
        // SAFETY: the exclusive `'static` borrow is handed over to the heap.
        unsafe { Self::new(base, size, config) }
    }

    #[inline]
    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let tag = engine::caller_tag(self.core.config());
        self.allocate_with_tag(size, 0, tag)
    }

    /// Allocate with the payload aligned to `align` (a power of two; 0 or 1
    /// for none).
    #[track_caller]
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let tag = engine::caller_tag(self.core.config());
        self.allocate_with_tag(size, align, tag)
    }

    /// Allocate and store `tag` in the header.
    pub fn allocate_with_tag(
        &mut self,
        size: usize,
        align: usize,
        tag: u32,
    ) -> Option<NonNull<u8>> {
        let payload = self.core.allocate(size, align, tag)?;
        Some(self.core.store().at(payload))
    }

    /// Return a block to the heap, coalescing it into the preceding span.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not released since.
    /// The block's memory must not be used afterwards.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        self.core.release(Self::addr(ptr));
    }

    /// Whether `ptr` points into the arena.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.core.store().arena_start();
        let addr = Self::addr(ptr);
        addr >= start && addr < start + self.arena_size()
    }

    #[must_use]
    pub fn arena_size(&self) -> usize {
        self.core.store().arena_size()
    }

    /// Bytes usable at `ptr`, or `None` if no live block starts there.
    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.core.usable_size(Self::addr(ptr))
    }

    /// Diagnostic tag of the block at `ptr`.
    #[must_use]
    pub fn tag_of(&self, ptr: NonNull<u8>) -> Option<u32> {
        self.core.tag_of(Self::addr(ptr))
    }

    /// Largest payload a single allocation can currently get.
    #[must_use]
    pub fn max_free_block(&self) -> usize {
        self.core.max_free_block()
    }

    #[must_use]
    pub fn bytes_available(&self, net: bool) -> usize {
        self.core.bytes_available(net)
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.core.bytes_allocated()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.core.stats()
    }

    /// Memory map in address order.
    #[must_use]
    pub fn spans(&self) -> Vec<SpanInfo> {
        self.core.spans()
    }

    pub fn verify(&self) -> Result<(), IntegrityError> {
        self.core.verify()
    }

    #[must_use]
    pub fn free_index_dot(&self) -> String {
        self.core.store().free_dot()
    }

    #[must_use]
    pub fn address_index_dot(&self) -> String {
        self.core.store().addr_dot()
    }

    pub fn lifecycle_logs(&self) -> impl Iterator<Item = &HeapLogRecord> {
        self.core.lifecycle_logs()
    }

    pub fn drain_lifecycle_logs(&mut self) -> Vec<HeapLogRecord> {
        self.core.drain_lifecycle_logs()
    }
}

impl ArenaAllocator for NativeHeap {
    type Block = NonNull<u8>;

    fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        NativeHeap::allocate_aligned(self, size, align)
    }

    unsafe fn release(&mut self, block: NonNull<u8>) {
        // SAFETY: forwarded contract.
        unsafe { NativeHeap::release(self, block) }
    }

    fn max_free_block(&self) -> usize {
        NativeHeap::max_free_block(self)
    }

    fn bytes_available(&self, net: bool) -> usize {
        NativeHeap::bytes_available(self, net)
    }

    fn bytes_allocated(&self) -> usize {
        NativeHeap::bytes_allocated(self)
    }

    fn stats(&self) -> HeapStats {
        NativeHeap::stats(self)
    }
}
