//! Position-independent heap over a byte slice.
//!
//! Every link, root and header field is a 32-bit little-endian offset from the
//! start of the slice, so the arena image can be copied, persisted or mapped
//! at another address and reopened with [`RelocatableHeap::attach`].
//!
//! Bootstrap record at offset 0 ([`ROOT_RECORD_SIZE`] bytes):
//!
//! | offset | field |
//! |---|---|
//! | 0 | free index root |
//! | 4 | address index root |
//! | 8 | shared sentinel node (20 bytes) |
//! | 28 | bootstrap header |
//!
//! Header ([`HEADER_SIZE`] bytes):
//!
//! | offset | field |
//! |---|---|
//! | 0 | span base |
//! | 4 | span size (header + padding + payload) |
//! | 8 | diagnostic tag, 0 if none |
//! | 12 | free index node |
//! | 32 | address index node |
//! | 52 | free record: in-index flag (bit 0), base (bits 1..32) |
//! | 56 | free record size |
//! | 60 | next same-size free record, 0 if none |
//! | 64 | previous same-size free record, 0 if none |
//! | 68 | padding word |
//!
//! The 32-bit word immediately before each payload holds the padding between
//! header and payload; for unpadded blocks it is the header's own last word.
//! Alignment applies to payload offsets.

use std::collections::HashSet;

use arenaheap_index::compact::{self, NODE_SIZE, read_u32, write_u32};
use arenaheap_index::{CompactTree, IndexRead, IndexViolation, Offset};

use super::engine::{self, FreeRecord, HeapCore, SpanStore};
use super::{ArenaAllocator, HeapStats, SpanInfo};
use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult, IntegrityError};
use crate::log::HeapLogRecord;

pub const HEADER_SIZE: usize = 72;
pub const ROOT_RECORD_SIZE: usize = 100;
/// Largest arena whose offsets fit the 31-bit fields.
pub const MAX_ARENA_SIZE: usize = (u32::MAX >> 1) as usize;

const H_ABASE: usize = 0;
const H_ASIZE: usize = 4;
const H_TAG: usize = 8;
const H_FNODE: u32 = 12;
const H_ANODE: u32 = 32;
const H_FWORD: usize = 52;
const H_FSIZE: usize = 56;
const H_FNEXT: usize = 60;
const H_FPREV: usize = 64;

const R_FROOT: u32 = 0;
const R_AROOT: u32 = 4;
const R_NIL: u32 = 8;
const R_HEADER: u32 = R_NIL + NODE_SIZE as u32;

const IN_TREE: u32 = 1;

const _: () = assert!(R_HEADER as usize + HEADER_SIZE == ROOT_RECORD_SIZE);
const _: () = assert!(H_FNODE as usize + NODE_SIZE == H_ANODE as usize);
const _: () = assert!(H_ANODE as usize + NODE_SIZE == H_FWORD);
const _: () = assert!(H_FPREV + 8 == HEADER_SIZE);

struct CompactStore<'a> {
    mem: &'a mut [u8],
    free: CompactTree,
    addr: CompactTree,
}

impl CompactStore<'_> {
    fn trees() -> (CompactTree, CompactTree) {
        let nil = Offset::new(R_NIL);
        (
            CompactTree::new(Offset::new(R_FROOT), nil),
            CompactTree::new(Offset::new(R_AROOT), nil),
        )
    }

    #[inline]
    fn word(&self, span: Offset, field: usize) -> u32 {
        read_u32(&*self.mem, span.as_usize() + field)
    }

    #[inline]
    fn set_word(&mut self, span: Offset, field: usize, value: u32) {
        write_u32(self.mem, span.as_usize() + field, value);
    }

    #[inline]
    fn record_link(span: Option<Offset>) -> u32 {
        span.map_or(0, |s| s.get() + H_FWORD as u32)
    }

    #[inline]
    fn span_of_record(raw: u32) -> Option<Offset> {
        (raw != 0).then(|| Offset::new(raw - H_FWORD as u32))
    }
}

impl SpanStore for CompactStore<'_> {
    type Span = Offset;

    const VARIANT: &'static str = "relocatable";
    const HEADER_SIZE: usize = HEADER_SIZE;
    const BOOTSTRAP_SIZE: usize = ROOT_RECORD_SIZE;
    const MAX_SPAN: usize = compact::KEY_MAX as usize;

    fn arena_start(&self) -> usize {
        0
    }

    fn arena_size(&self) -> usize {
        self.mem.len()
    }

    fn bootstrap(&self) -> Offset {
        Offset::new(R_HEADER)
    }

    fn span_at(&self, addr: usize) -> Offset {
        Offset::new(addr as u32)
    }

    fn abase(&self, span: Offset) -> usize {
        self.word(span, H_ABASE) as usize
    }

    fn asize(&self, span: Offset) -> usize {
        self.word(span, H_ASIZE) as usize
    }

    fn tag(&self, span: Offset) -> u32 {
        self.word(span, H_TAG)
    }

    fn write_header(&mut self, span: Offset, abase: usize, asize: usize, tag: u32) {
        self.set_word(span, H_ABASE, abase as u32);
        self.set_word(span, H_ASIZE, asize as u32);
        self.set_word(span, H_TAG, tag);
        self.set_free_record(span, &FreeRecord::empty(abase + asize));
    }

    fn free_record(&self, span: Offset) -> FreeRecord<Offset> {
        let head = self.word(span, H_FWORD);
        FreeRecord {
            in_tree: head & IN_TREE != 0,
            base: (head >> 1) as usize,
            size: self.word(span, H_FSIZE) as usize,
            next: Self::span_of_record(self.word(span, H_FNEXT)),
            prev: Self::span_of_record(self.word(span, H_FPREV)),
        }
    }

    fn set_free_record(&mut self, span: Offset, rec: &FreeRecord<Offset>) {
        let head = ((rec.base as u32) << 1) | u32::from(rec.in_tree);
        self.set_word(span, H_FWORD, head);
        self.set_word(span, H_FSIZE, rec.size as u32);
        self.set_word(span, H_FNEXT, Self::record_link(rec.next));
        self.set_word(span, H_FPREV, Self::record_link(rec.prev));
    }

    fn padding(&self, payload: usize) -> u32 {
        read_u32(&*self.mem, payload - 4)
    }

    fn set_padding(&mut self, payload: usize, padding: u32) {
        write_u32(self.mem, payload - 4, padding);
    }

    fn free_insert(&mut self, span: Offset, size: usize) {
        self.free
            .view(self.mem)
            .insert(size as u32, span.add(H_FWORD as u32), span.add(H_FNODE));
    }

    fn free_delete(&mut self, span: Offset) {
        self.free.view(self.mem).delete(span.add(H_FNODE));
    }

    fn free_key(&self, span: Offset) -> usize {
        self.free.read(&*self.mem).key(span.add(H_FNODE)) as usize
    }

    fn free_search(&self, size: usize) -> Option<Offset> {
        let r = self.free.read(&*self.mem);
        r.search(size as u64).map(|n| n.sub(H_FNODE))
    }

    fn free_min_at_least(&self, size: usize) -> Option<Offset> {
        let r = self.free.read(&*self.mem);
        r.min_at_least(size as u64).map(|n| n.sub(H_FNODE))
    }

    fn free_next_larger(&self, span: Offset) -> Option<Offset> {
        let r = self.free.read(&*self.mem);
        r.next_larger(span.add(H_FNODE)).map(|n| n.sub(H_FNODE))
    }

    fn free_max(&self) -> Option<Offset> {
        self.free.read(&*self.mem).max().map(|n| n.sub(H_FNODE))
    }

    fn for_each_free(&self, mut visit: impl FnMut(Offset)) {
        self.free
            .read(&*self.mem)
            .for_each_in_order(|n| visit(n.sub(H_FNODE)));
    }

    fn free_check(&self) -> Result<usize, IndexViolation> {
        self.free.read(&*self.mem).check()
    }

    fn free_dot(&self) -> String {
        self.free.read(&*self.mem).to_dot()
    }

    fn addr_insert(&mut self, span: Offset) {
        let key = self.word(span, H_ABASE);
        self.addr
            .view(self.mem)
            .insert(key, span, span.add(H_ANODE));
    }

    fn addr_delete(&mut self, span: Offset) {
        self.addr.view(self.mem).delete(span.add(H_ANODE));
    }

    fn addr_prev(&self, span: Offset) -> Option<Offset> {
        let r = self.addr.read(&*self.mem);
        r.next_smaller(span.add(H_ANODE)).map(|n| n.sub(H_ANODE))
    }

    fn for_each_span(&self, mut visit: impl FnMut(Offset)) {
        self.addr
            .read(&*self.mem)
            .for_each_in_order(|n| visit(n.sub(H_ANODE)));
    }

    fn addr_check(&self) -> Result<usize, IndexViolation> {
        self.addr.read(&*self.mem).check()
    }

    fn addr_dot(&self) -> String {
        self.addr.read(&*self.mem).to_dot()
    }
}

fn check_arena_size(size: usize) -> HeapResult<()> {
    if size > MAX_ARENA_SIZE {
        return Err(HeapError::ArenaTooLarge {
            size,
            max: MAX_ARENA_SIZE,
        });
    }
    if size < ROOT_RECORD_SIZE {
        return Err(HeapError::ArenaTooSmall {
            size,
            min: ROOT_RECORD_SIZE,
        });
    }
    Ok(())
}

/// Check every index and free-chain link of an untrusted image so that
/// verification only reads inside `mem` and terminates.
///
/// Address index nodes must be embedded in headers that fit the arena; free
/// index nodes and chain links must belong to spans of the address index.
fn check_links(mem: &[u8], free: CompactTree, addr: CompactTree) -> Result<(), IntegrityError> {
    let len = mem.len();
    let max_nodes = len / HEADER_SIZE + 1;
    let is_span = |span: u32| {
        (span == R_HEADER || span as usize >= ROOT_RECORD_SIZE)
            && span as usize + HEADER_SIZE <= len
    };
    let addr_nodes = addr
        .read(mem)
        .check_links(max_nodes, |n| n.get().checked_sub(H_ANODE).is_some_and(is_span))
        .map_err(|source| IntegrityError::Index {
            index: "address",
            source,
        })?;
    let spans: HashSet<u32> = addr_nodes.iter().map(|n| n.get() - H_ANODE).collect();
    let known = |span: Option<u32>| span.is_some_and(|s| spans.contains(&s));

    free.read(mem)
        .check_links(max_nodes, |n| known(n.get().checked_sub(H_FNODE)))
        .map_err(|source| IntegrityError::Index {
            index: "free",
            source,
        })?;
    for node in &addr_nodes {
        let span = node.get() - H_ANODE;
        for field in [H_FNEXT, H_FPREV] {
            let link = read_u32(mem, span as usize + field);
            if link != 0 && !known(link.checked_sub(H_FWORD as u32)) {
                return Err(IntegrityError::FreeRecord {
                    offset: span as usize,
                    reason: "free chain link does not name a span",
                });
            }
        }
    }
    Ok(())
}

/// Heap whose metadata is entirely offset-based; blocks are [`Offset`]s into
/// the borrowed arena.
pub struct RelocatableHeap<'a> {
    core: HeapCore<CompactStore<'a>>,
}

impl<'a> RelocatableHeap<'a> {
    /// Format `mem` as an empty heap.
    pub fn init(mem: &'a mut [u8], config: HeapConfig) -> HeapResult<Self> {
        check_arena_size(mem.len())?;
        let nil = Offset::new(R_NIL);
        let free = CompactTree::init(mem, Offset::new(R_FROOT), nil);
        let addr = CompactTree::init(mem, Offset::new(R_AROOT), nil);
        let store = CompactStore { mem, free, addr };
        Ok(Self {
            core: HeapCore::format(store, config),
        })
    }

    /// Reopen a heap image written by [`RelocatableHeap::init`] and later
    /// operations, possibly copied from another location.
    ///
    /// Every link in the image is range-checked before it is followed, then
    /// the heap is fully verified. A damaged image yields
    /// [`HeapError::Corrupt`].
    pub fn attach(mem: &'a mut [u8], config: HeapConfig) -> HeapResult<Self> {
        check_arena_size(mem.len())?;
        let len = mem.len() as u32;
        let boot = R_HEADER as usize;
        let roots_in_range = read_u32(mem, R_FROOT as usize) < len
            && read_u32(mem, R_AROOT as usize) < len;
        if !roots_in_range {
            return Err(HeapError::NotInitialized {
                reason: "index root outside the arena",
            });
        }
        if read_u32(mem, boot + H_ABASE) != 0
            || read_u32(mem, boot + H_ASIZE) as usize != ROOT_RECORD_SIZE
        {
            return Err(HeapError::NotInitialized {
                reason: "bootstrap header does not describe the root record",
            });
        }
        let (free, addr) = CompactStore::trees();
        check_links(mem, free, addr)?;
        let store = CompactStore { mem, free, addr };
        Ok(Self {
            core: HeapCore::resume(store, config)?,
        })
    }

    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Option<Offset> {
        let tag = engine::caller_tag(self.core.config());
        self.allocate_with_tag(size, 0, tag)
    }

    /// Allocate with the payload offset aligned to `align` (a power of two; 0
    /// or 1 for none).
    #[track_caller]
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<Offset> {
        let tag = engine::caller_tag(self.core.config());
        self.allocate_with_tag(size, align, tag)
    }

    pub fn allocate_with_tag(&mut self, size: usize, align: usize, tag: u32) -> Option<Offset> {
        let payload = self.core.allocate(size, align, tag)?;
        Some(Offset::new(payload as u32))
    }

    /// Return a block to the heap.
    ///
    /// Releasing an offset that is not a live block is fatal when detected
    /// (see [`crate::FatalPolicy`]) and otherwise corrupts the heap.
    pub fn release(&mut self, block: Offset) {
        self.core.release(block.as_usize());
    }

    /// Payload bytes of a live block.
    #[must_use]
    pub fn payload(&self, block: Offset) -> Option<&[u8]> {
        let len = self.core.usable_size(block.as_usize())?;
        let start = block.as_usize();
        Some(&self.arena()[start..start + len])
    }

    #[must_use]
    pub fn payload_mut(&mut self, block: Offset) -> Option<&mut [u8]> {
        let len = self.core.usable_size(block.as_usize())?;
        let start = block.as_usize();
        Some(&mut self.core.store_mut().mem[start..start + len])
    }

    /// The whole arena image, metadata included.
    #[must_use]
    pub fn arena(&self) -> &[u8] {
        &*self.core.store().mem
    }

    #[must_use]
    pub fn usable_size(&self, block: Offset) -> Option<usize> {
        self.core.usable_size(block.as_usize())
    }

    #[must_use]
    pub fn tag_of(&self, block: Offset) -> Option<u32> {
        self.core.tag_of(block.as_usize())
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

    /// Give the arena back; its bytes remain a valid heap image.
    #[must_use]
    pub fn into_inner(self) -> &'a mut [u8] {
        self.core.into_store().mem
    }
}

impl<'a> ArenaAllocator for RelocatableHeap<'a> {
    type Block = Offset;

    fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<Offset> {
        RelocatableHeap::allocate_aligned(self, size, align)
    }

    #[allow(unsafe_code)]
    unsafe fn release(&mut self, block: Offset) {
        RelocatableHeap::release(self, block);
    }

    fn max_free_block(&self) -> usize {
        RelocatableHeap::max_free_block(self)
    }

    fn bytes_available(&self, net: bool) -> usize {
        RelocatableHeap::bytes_available(self, net)
    }

    fn bytes_allocated(&self) -> usize {
        RelocatableHeap::bytes_allocated(self)
    }

    fn stats(&self) -> HeapStats {
        RelocatableHeap::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FatalPolicy;

    fn config() -> HeapConfig {
        HeapConfig::default().with_fatal(FatalPolicy::Panic)
    }

    #[test]
    fn bootstrap_record_layout() {
        let mut mem = vec![0xeeu8; 4096];
        let heap = RelocatableHeap::init(&mut mem, config()).unwrap();
        let img = heap.arena();
        // Sentinel is black with key 0.
        assert_eq!(read_u32(img, R_NIL as usize), 1 << 31);
        // Bootstrap header covers the root record and owns the rest.
        let boot = R_HEADER as usize;
        assert_eq!(read_u32(img, boot + H_ABASE), 0);
        assert_eq!(read_u32(img, boot + H_ASIZE), ROOT_RECORD_SIZE as u32);
        assert_eq!(read_u32(img, boot + H_FSIZE), 4096 - ROOT_RECORD_SIZE as u32);
        assert_eq!(
            read_u32(img, boot + H_FWORD),
            ((ROOT_RECORD_SIZE as u32) << 1) | IN_TREE
        );
        // Both roots point at the bootstrap's embedded nodes.
        assert_eq!(read_u32(img, R_FROOT as usize), R_HEADER + H_FNODE);
        assert_eq!(read_u32(img, R_AROOT as usize), R_HEADER + H_ANODE);
    }

    #[test]
    fn padding_word_precedes_payload() {
        let mut mem = vec![0u8; 4096];
        let mut heap = RelocatableHeap::init(&mut mem, config()).unwrap();
        let plain = heap.allocate(10).unwrap();
        assert_eq!(plain.as_usize(), ROOT_RECORD_SIZE + HEADER_SIZE);
        assert_eq!(read_u32(heap.arena(), plain.as_usize() - 4), 0);

        let aligned = heap.allocate_aligned(10, 64).unwrap();
        assert_eq!(aligned.get() % 64, 0);
        let header = ROOT_RECORD_SIZE + HEADER_SIZE + 10;
        let padding = aligned.as_usize() - header - HEADER_SIZE;
        assert_eq!(read_u32(heap.arena(), aligned.as_usize() - 4) as usize, padding);
        assert_eq!(read_u32(heap.arena(), header + H_ABASE) as usize, header);
    }

    #[test]
    fn oversized_and_undersized_arenas_are_rejected() {
        assert_eq!(
            check_arena_size(MAX_ARENA_SIZE + 1),
            Err(HeapError::ArenaTooLarge {
                size: MAX_ARENA_SIZE + 1,
                max: MAX_ARENA_SIZE
            })
        );
        assert!(check_arena_size(MAX_ARENA_SIZE).is_ok());
        let mut tiny = [0u8; 64];
        assert!(matches!(
            RelocatableHeap::init(&mut tiny, config()),
            Err(HeapError::ArenaTooSmall { size: 64, .. })
        ));
    }

    #[test]
    fn exact_bootstrap_sized_arena_has_no_free_space() {
        let mut mem = [0u8; ROOT_RECORD_SIZE];
        let mut heap = RelocatableHeap::init(&mut mem, config()).unwrap();
        assert_eq!(heap.bytes_available(false), 0);
        assert_eq!(heap.max_free_block(), 0);
        assert_eq!(heap.allocate(1), None);
        assert!(heap.verify().is_ok());
    }

    #[test]
    fn attach_rejects_blank_memory() {
        let mut mem = vec![0u8; 1024];
        assert!(matches!(
            RelocatableHeap::attach(&mut mem, config()),
            Err(HeapError::NotInitialized { .. })
        ));
    }

    #[test]
    fn payload_slices_cover_usable_size() {
        let mut mem = vec![0u8; 2048];
        let mut heap = RelocatableHeap::init(&mut mem, config()).unwrap();
        let block = heap.allocate(33).unwrap();
        heap.payload_mut(block).unwrap().fill(0x5a);
        assert_eq!(heap.payload(block).unwrap(), &[0x5a; 33][..]);
        assert!(heap.verify().is_ok());
        assert_eq!(heap.payload(Offset::new(3)), None);
    }
}
