//! Offset-linked index stored inside a byte arena.
//!
//! Node layout (20 bytes, little-endian, packed):
//!
//! | offset | field |
//! |---|---|
//! | 0 | key (bits 0..31), color (bit 31, black = 1) |
//! | 4 | payload offset |
//! | 8 | left offset |
//! | 12 | right offset |
//! | 16 | parent offset |
//!
//! Every link is relative to the start of the arena slice, so the whole tree
//! stays valid when the arena bytes are copied elsewhere. A tree is described
//! by a [`CompactTree`] (where the root slot and the sentinel live) and is
//! only ever dereferenced together with the arena it belongs to.

use std::fmt;

use crate::{Color, IndexRead, IndexViolation, IndexWrite};

/// Size of one compact node.
pub const NODE_SIZE: usize = 20;

/// Largest key a compact node can hold.
pub const KEY_MAX: u64 = 0x7fff_ffff;

const COLOR_BIT: u32 = 1 << 31;

const WORD_KEY: usize = 0;
const WORD_PAYLOAD: usize = 4;
const WORD_LEFT: usize = 8;
const WORD_RIGHT: usize = 12;
const WORD_PARENT: usize = 16;

/// Read a little-endian `u32` at byte `at`.
#[inline]
#[must_use]
pub fn read_u32(mem: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&mem[at..at + 4]);
    u32::from_le_bytes(word)
}

/// Write a little-endian `u32` at byte `at`.
#[inline]
pub fn write_u32(mem: &mut [u8], at: usize, value: u32) {
    mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Byte offset from the start of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Offset(u32);

impl Offset {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn add(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }

    #[must_use]
    pub const fn sub(self, bytes: u32) -> Self {
        Self(self.0 - bytes)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

/// Location of a compact tree inside its arena: the 32-bit root slot and the
/// sentinel node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTree {
    root_slot: Offset,
    nil: Offset,
}

impl CompactTree {
    /// Describe a tree that already exists in an arena.
    #[must_use]
    pub const fn new(root_slot: Offset, nil: Offset) -> Self {
        Self { root_slot, nil }
    }

    /// Write an empty tree: a black sentinel at `nil` and a root slot that
    /// points at it. Several trees may share one sentinel.
    pub fn init(mem: &mut [u8], root_slot: Offset, nil: Offset) -> Self {
        let at = nil.as_usize();
        write_u32(mem, at + WORD_KEY, COLOR_BIT);
        for word in [WORD_PAYLOAD, WORD_LEFT, WORD_RIGHT, WORD_PARENT] {
            write_u32(mem, at + word, nil.get());
        }
        write_u32(mem, root_slot.as_usize(), nil.get());
        Self { root_slot, nil }
    }

    #[must_use]
    pub const fn root_slot(&self) -> Offset {
        self.root_slot
    }

    #[must_use]
    pub const fn sentinel(&self) -> Offset {
        self.nil
    }

    /// Read-only view over `mem`.
    #[must_use]
    pub fn read(self, mem: &[u8]) -> CompactRef<'_> {
        CompactRef { mem, tree: self }
    }

    /// Mutable view over `mem`.
    #[must_use]
    pub fn view(self, mem: &mut [u8]) -> CompactView<'_> {
        CompactView { mem, tree: self }
    }
}

/// A [`CompactTree`] paired with shared access to its arena.
#[derive(Clone, Copy)]
pub struct CompactRef<'m> {
    mem: &'m [u8],
    tree: CompactTree,
}

impl CompactRef<'_> {
    #[inline]
    fn word(&self, node: Offset, word: usize) -> u32 {
        read_u32(self.mem, node.as_usize() + word)
    }

    /// Payload offset stored with `node`.
    #[must_use]
    pub fn payload(&self, node: Offset) -> Offset {
        Offset(self.word(node, WORD_PAYLOAD))
    }

    /// Walk every child link reachable from the root without trusting any
    /// of them.
    ///
    /// Each non-nil link must lie inside the arena and satisfy `is_node`. At
    /// most `max_nodes` nodes may be reachable, and no path may be deeper
    /// than a red-black tree of that many nodes allows. Once this succeeds,
    /// the queries and [`IndexRead::check`] only read inside the arena and
    /// terminate. Returns the reachable nodes in preorder.
    pub fn check_links(
        &self,
        max_nodes: usize,
        is_node: impl Fn(Offset) -> bool,
    ) -> Result<Vec<Offset>, IndexViolation> {
        let len = self.mem.len();
        let in_arena =
            |at: Offset, size: usize| at.as_usize().checked_add(size).is_some_and(|end| end <= len);
        let slot = self.tree.root_slot;
        let nil = self.tree.nil;
        if !in_arena(slot, 4) || !in_arena(nil, NODE_SIZE) {
            return Err(IndexViolation::BadLink {
                from: u64::from(slot.get()),
                link: u64::from(nil.get()),
            });
        }
        // A red-black tree with n nodes is at most 2 * log2(n + 1) deep.
        let max_depth = 2 * (usize::BITS - max_nodes.saturating_add(1).leading_zeros()) as usize;

        let mut out = Vec::new();
        let root = self.root();
        if root == nil {
            return Ok(out);
        }
        if !in_arena(root, NODE_SIZE) || !is_node(root) {
            return Err(IndexViolation::BadLink {
                from: u64::from(slot.get()),
                link: u64::from(root.get()),
            });
        }
        let mut stack = vec![(root, 1usize)];
        while let Some((node, depth)) = stack.pop() {
            if out.len() == max_nodes {
                return Err(IndexViolation::TooManyNodes { limit: max_nodes });
            }
            if depth > max_depth {
                return Err(IndexViolation::TooDeep { limit: max_depth });
            }
            out.push(node);
            for child in [self.left(node), self.right(node)] {
                if child == nil {
                    continue;
                }
                if !in_arena(child, NODE_SIZE) || !is_node(child) {
                    return Err(IndexViolation::BadLink {
                        from: u64::from(node.get()),
                        link: u64::from(child.get()),
                    });
                }
                stack.push((child, depth + 1));
            }
        }
        Ok(out)
    }
}

impl IndexRead for CompactRef<'_> {
    type Ref = Offset;

    #[inline]
    fn nil(&self) -> Offset {
        self.tree.nil
    }

    #[inline]
    fn root(&self) -> Offset {
        Offset(read_u32(self.mem, self.tree.root_slot.as_usize()))
    }

    #[inline]
    fn key(&self, node: Offset) -> u64 {
        u64::from(self.word(node, WORD_KEY) & !COLOR_BIT)
    }

    #[inline]
    fn color(&self, node: Offset) -> Color {
        if self.word(node, WORD_KEY) & COLOR_BIT != 0 {
            Color::Black
        } else {
            Color::Red
        }
    }

    #[inline]
    fn left(&self, node: Offset) -> Offset {
        Offset(self.word(node, WORD_LEFT))
    }

    #[inline]
    fn right(&self, node: Offset) -> Offset {
        Offset(self.word(node, WORD_RIGHT))
    }

    #[inline]
    fn parent(&self, node: Offset) -> Offset {
        Offset(self.word(node, WORD_PARENT))
    }
}

/// A [`CompactTree`] paired with exclusive access to its arena.
pub struct CompactView<'m> {
    mem: &'m mut [u8],
    tree: CompactTree,
}

impl CompactView<'_> {
    #[inline]
    fn reader(&self) -> CompactRef<'_> {
        CompactRef {
            mem: &*self.mem,
            tree: self.tree,
        }
    }

    #[inline]
    fn set_word(&mut self, node: Offset, word: usize, value: u32) {
        write_u32(self.mem, node.as_usize() + word, value);
    }

    /// Link the node stored at `node` under `key` with `payload`.
    ///
    /// # Panics
    ///
    /// Panics if `node` does not lie inside the arena.
    pub fn insert(&mut self, key: u32, payload: Offset, node: Offset) {
        debug_assert!(u64::from(key) <= KEY_MAX, "compact key overflows 31 bits");
        self.set_word(node, WORD_PAYLOAD, payload.get());
        self.link(node, u64::from(key));
    }

    /// Unlink `node`, which must currently belong to this tree.
    pub fn delete(&mut self, node: Offset) {
        self.unlink(node);
    }

    #[must_use]
    pub fn payload(&self, node: Offset) -> Offset {
        self.reader().payload(node)
    }
}

impl IndexRead for CompactView<'_> {
    type Ref = Offset;

    #[inline]
    fn nil(&self) -> Offset {
        self.tree.nil
    }

    #[inline]
    fn root(&self) -> Offset {
        self.reader().root()
    }

    #[inline]
    fn key(&self, node: Offset) -> u64 {
        self.reader().key(node)
    }

    #[inline]
    fn color(&self, node: Offset) -> Color {
        self.reader().color(node)
    }

    #[inline]
    fn left(&self, node: Offset) -> Offset {
        self.reader().left(node)
    }

    #[inline]
    fn right(&self, node: Offset) -> Offset {
        self.reader().right(node)
    }

    #[inline]
    fn parent(&self, node: Offset) -> Offset {
        self.reader().parent(node)
    }
}

impl IndexWrite for CompactView<'_> {
    #[inline]
    fn set_root(&mut self, node: Offset) {
        let slot = self.tree.root_slot.as_usize();
        write_u32(self.mem, slot, node.get());
    }

    #[inline]
    fn set_key(&mut self, node: Offset, key: u64) {
        let color = self.reader().word(node, WORD_KEY) & COLOR_BIT;
        self.set_word(node, WORD_KEY, (key as u32 & !COLOR_BIT) | color);
    }

    #[inline]
    fn set_color(&mut self, node: Offset, color: Color) {
        let key = self.reader().word(node, WORD_KEY) & !COLOR_BIT;
        let bit = match color {
            Color::Red => 0,
            Color::Black => COLOR_BIT,
        };
        self.set_word(node, WORD_KEY, key | bit);
    }

    #[inline]
    fn set_left(&mut self, node: Offset, child: Offset) {
        self.set_word(node, WORD_LEFT, child.get());
    }

    #[inline]
    fn set_right(&mut self, node: Offset, child: Offset) {
        self.set_word(node, WORD_RIGHT, child.get());
    }

    #[inline]
    fn set_parent(&mut self, node: Offset, parent: Offset) {
        self.set_word(node, WORD_PARENT, parent.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: Offset = Offset(0);
    const NIL: Offset = Offset(4);

    fn node(i: u32) -> Offset {
        Offset(24 + i * NODE_SIZE as u32)
    }

    fn arena(nodes: u32) -> (Vec<u8>, CompactTree) {
        let mut mem = vec![0xa5; 24 + nodes as usize * NODE_SIZE];
        let tree = CompactTree::init(&mut mem, ROOT, NIL);
        (mem, tree)
    }

    #[test]
    fn init_writes_black_sentinel_and_empty_root() {
        let (mem, tree) = arena(0);
        let r = tree.read(&mem);
        assert!(r.is_empty());
        assert_eq!(r.color(NIL), Color::Black);
        assert_eq!(read_u32(&mem, 0), 4);
    }

    #[test]
    fn key_and_color_share_first_word() {
        let (mut mem, tree) = arena(1);
        tree.view(&mut mem).insert(KEY_MAX as u32, Offset(99), node(0));
        let r = tree.read(&mem);
        assert_eq!(r.key(node(0)), KEY_MAX);
        assert_eq!(r.color(node(0)), Color::Black);
        assert_eq!(read_u32(&mem, node(0).as_usize()), u32::MAX);
        assert_eq!(r.payload(node(0)), Offset(99));
    }

    #[test]
    fn copied_arena_is_still_a_valid_tree() {
        let (mut mem, tree) = arena(8);
        {
            let mut v = tree.view(&mut mem);
            for (i, k) in [50u32, 10, 90, 30, 70, 20, 80, 60].into_iter().enumerate() {
                v.insert(k, Offset(k), node(i as u32));
            }
        }
        let copy = mem.clone();
        drop(mem);
        let r = tree.read(&copy);
        assert!(r.check().is_ok());
        let keys: Vec<u64> = r.in_order().into_iter().map(|n| r.key(n)).collect();
        assert_eq!(keys, vec![10, 20, 30, 50, 60, 70, 80, 90]);
        let n = r.search(70).expect("70 present");
        assert_eq!(r.payload(n), Offset(70));
    }

    #[test]
    fn two_trees_can_share_one_sentinel() {
        let mut mem = vec![0u8; 28 + 4 * NODE_SIZE];
        let nil = Offset(8);
        let a = CompactTree::init(&mut mem, Offset(0), nil);
        let b = CompactTree::init(&mut mem, Offset(4), nil);
        let base = 28u32;
        a.view(&mut mem).insert(1, Offset(0), Offset(base));
        b.view(&mut mem).insert(2, Offset(0), Offset(base + 20));
        a.view(&mut mem).insert(3, Offset(0), Offset(base + 40));
        b.view(&mut mem).delete(Offset(base + 20));
        assert_eq!(a.read(&mem).len(), 2);
        assert!(b.read(&mem).is_empty());
        assert!(a.read(&mem).check().is_ok());
    }

    fn linked(keys: &[u32]) -> (Vec<u8>, CompactTree) {
        let (mut mem, tree) = arena(keys.len() as u32);
        let mut v = tree.view(&mut mem);
        for (i, &k) in keys.iter().enumerate() {
            v.insert(k, Offset(0), node(i as u32));
        }
        (mem, tree)
    }

    fn is_pool_node(n: Offset) -> bool {
        n.get() >= 24 && (n.get() - 24) % NODE_SIZE as u32 == 0
    }

    #[test]
    fn link_walk_reaches_every_node_of_a_sound_tree() {
        let (mem, tree) = linked(&[5, 3, 8, 1, 4, 7, 9]);
        let mut nodes = tree.read(&mem).check_links(7, is_pool_node).unwrap();
        nodes.sort();
        assert_eq!(nodes, (0..7).map(node).collect::<Vec<_>>());
        assert_eq!(
            tree.read(&mem).check_links(6, is_pool_node),
            Err(IndexViolation::TooManyNodes { limit: 6 })
        );
    }

    #[test]
    fn link_walk_stops_on_a_self_loop() {
        let (mut mem, tree) = linked(&[5, 3, 8]);
        let root = tree.read(&mem).root();
        write_u32(&mut mem, root.as_usize() + WORD_LEFT, root.get());
        assert!(matches!(
            tree.read(&mem).check_links(64, is_pool_node),
            Err(IndexViolation::TooDeep { .. })
        ));
    }

    #[test]
    fn link_walk_rejects_links_past_the_end_or_off_the_grid() {
        let (mut mem, tree) = linked(&[5, 3, 8]);
        let root = tree.read(&mem).root();
        let end = mem.len() as u32 - 2;
        write_u32(&mut mem, root.as_usize() + WORD_RIGHT, end);
        assert_eq!(
            tree.read(&mem).check_links(64, |_| true),
            Err(IndexViolation::BadLink {
                from: u64::from(root.get()),
                link: u64::from(end),
            })
        );
        write_u32(&mut mem, root.as_usize() + WORD_RIGHT, node(0).get() + 1);
        assert!(matches!(
            tree.read(&mem).check_links(64, is_pool_node),
            Err(IndexViolation::BadLink { .. })
        ));
    }

    #[test]
    fn offset_display_is_hex() {
        assert_eq!(Offset::new(0x40).to_string(), "+0x40");
        assert_eq!(Offset::new(8).add(12).sub(4), Offset::new(16));
    }
}
