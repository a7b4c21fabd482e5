//! Pointer-linked index.
//!
//! Nodes are caller-owned [`RbNode`] storage, typically embedded in a larger
//! record. `RbNode` is packed (alignment 1) so it can live at any byte address
//! inside an arena; every field access goes through an unaligned read or write.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use crate::{Color, IndexRead, IndexWrite};

/// Node storage for [`RbTree`].
#[repr(C, packed)]
pub struct RbNode {
    key: u64,
    color: Color,
    payload: *mut u8,
    left: *mut RbNode,
    right: *mut RbNode,
    parent: *mut RbNode,
}

impl RbNode {
    /// A detached black node with null links.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            key: 0,
            color: Color::Black,
            payload: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent: ptr::null_mut(),
        }
    }

    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }

    #[must_use]
    pub fn color(&self) -> Color {
        self.color
    }

    #[must_use]
    pub fn payload(&self) -> *mut u8 {
        self.payload
    }
}

impl Default for RbNode {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! load {
    ($node:expr, $field:ident) => {
        // SAFETY: `$node` is the sentinel owned by the tree or a node linked
        // through `RbTree::insert`, whose contract keeps it valid.
        unsafe { (&raw const (*$node.as_ptr()).$field).read_unaligned() }
    };
}

macro_rules! store {
    ($node:expr, $field:ident, $value:expr) => {
        // SAFETY: see `load!`.
        unsafe { (&raw mut (*$node.as_ptr()).$field).write_unaligned($value) }
    };
}

/// Red-black tree over caller-owned [`RbNode`] storage.
///
/// The sentinel is heap-allocated per tree and freed on drop.
pub struct RbTree {
    root: NonNull<RbNode>,
    nil: NonNull<RbNode>,
}

impl RbTree {
    #[must_use]
    pub fn new() -> Self {
        let nil = NonNull::from(Box::leak(Box::new(RbNode::new())));
        Self { root: nil, nil }
    }

    /// Link `node` under `key` with `payload`.
    ///
    /// # Safety
    ///
    /// `node` must point to writable `RbNode` storage that stays valid, is not
    /// moved and is not accessed other than through this tree until it is
    /// removed with [`RbTree::delete`]. A node belongs to at most one tree at a
    /// time. Node handles returned by this tree must not be used once their
    /// storage has been released.
    pub unsafe fn insert(&mut self, key: u64, payload: *mut u8, node: NonNull<RbNode>) {
        store!(node, payload, payload);
        self.link(node, key);
    }

    /// Unlink `node`.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into this tree.
    pub unsafe fn delete(&mut self, node: NonNull<RbNode>) {
        self.unlink(node);
    }

    /// Payload pointer stored with `node`.
    #[must_use]
    pub fn payload(&self, node: NonNull<RbNode>) -> *mut u8 {
        load!(node, payload)
    }
}

impl Default for RbTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RbTree {
    fn drop(&mut self) {
        // SAFETY: `nil` came from `Box::leak` in `new` and is freed only here.
        drop(unsafe { Box::from_raw(self.nil.as_ptr()) });
    }
}

#[inline]
fn link_of(p: *mut RbNode, nil: NonNull<RbNode>) -> NonNull<RbNode> {
    NonNull::new(p).unwrap_or(nil)
}

impl IndexRead for RbTree {
    type Ref = NonNull<RbNode>;

    #[inline]
    fn nil(&self) -> Self::Ref {
        self.nil
    }

    #[inline]
    fn root(&self) -> Self::Ref {
        self.root
    }

    #[inline]
    fn key(&self, node: Self::Ref) -> u64 {
        load!(node, key)
    }

    #[inline]
    fn color(&self, node: Self::Ref) -> Color {
        load!(node, color)
    }

    #[inline]
    fn left(&self, node: Self::Ref) -> Self::Ref {
        link_of(load!(node, left), self.nil)
    }

    #[inline]
    fn right(&self, node: Self::Ref) -> Self::Ref {
        link_of(load!(node, right), self.nil)
    }

    #[inline]
    fn parent(&self, node: Self::Ref) -> Self::Ref {
        link_of(load!(node, parent), self.nil)
    }
}

impl IndexWrite for RbTree {
    #[inline]
    fn set_root(&mut self, node: Self::Ref) {
        self.root = node;
    }

    #[inline]
    fn set_key(&mut self, node: Self::Ref, key: u64) {
        store!(node, key, key);
    }

    #[inline]
    fn set_color(&mut self, node: Self::Ref, color: Color) {
        store!(node, color, color);
    }

    #[inline]
    fn set_left(&mut self, node: Self::Ref, child: Self::Ref) {
        store!(node, left, child.as_ptr());
    }

    #[inline]
    fn set_right(&mut self, node: Self::Ref, child: Self::Ref) {
        store!(node, right, child.as_ptr());
    }

    #[inline]
    fn set_parent(&mut self, node: Self::Ref, parent: Self::Ref) {
        store!(node, parent, parent.as_ptr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pool {
        _nodes: Box<[RbNode]>,
        base: *mut RbNode,
        len: usize,
    }

    impl Pool {
        fn new(n: usize) -> Self {
            let mut nodes: Box<[RbNode]> = (0..n).map(|_| RbNode::new()).collect();
            let base = nodes.as_mut_ptr();
            Self {
                _nodes: nodes,
                base,
                len: n,
            }
        }

        fn at(&mut self, i: usize) -> NonNull<RbNode> {
            assert!(i < self.len);
            NonNull::new(self.base.wrapping_add(i)).unwrap()
        }
    }

    fn insert_all(tree: &mut RbTree, pool: &mut Pool, keys: &[u64]) -> Vec<NonNull<RbNode>> {
        keys.iter()
            .enumerate()
            .map(|(i, &k)| {
                let node = pool.at(i);
                // SAFETY: the pool outlives the tree in every test and is not
                // touched while nodes are linked.
                unsafe { tree.insert(k, ptr::null_mut(), node) };
                node
            })
            .collect()
    }

    #[test]
    fn empty_tree_has_no_extremes() {
        let tree = RbTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.min(), None);
        assert_eq!(tree.max(), None);
        assert_eq!(tree.search(1), None);
        assert_eq!(tree.check(), Ok(0));
    }

    #[test]
    fn sentinel_is_per_tree() {
        let a = RbTree::new();
        let b = RbTree::new();
        assert_ne!(a.nil(), b.nil());
    }

    #[test]
    fn three_keys_balance_around_middle() {
        let mut pool = Pool::new(3);
        let mut tree = RbTree::new();
        let n = insert_all(&mut tree, &mut pool, &[3, 5, 2]);
        assert_eq!(tree.root(), n[0]);
        assert_eq!(tree.color(n[0]), Color::Black);
        assert_eq!(tree.right(n[0]), n[1]);
        assert_eq!(tree.left(n[0]), n[2]);
        assert_eq!(tree.color(n[1]), Color::Red);
        assert_eq!(tree.color(n[2]), Color::Red);
    }

    #[test]
    fn payload_round_trips_through_node() {
        let mut pool = Pool::new(1);
        let mut tree = RbTree::new();
        let mut target = 7u8;
        let node = pool.at(0);
        // SAFETY: pool outlives the tree.
        unsafe { tree.insert(9, &raw mut target, node) };
        assert_eq!(tree.payload(node), &raw mut target);
        assert_eq!(tree.search(9), Some(node));
    }

    #[test]
    fn duplicate_keys_are_all_kept() {
        let mut pool = Pool::new(5);
        let mut tree = RbTree::new();
        insert_all(&mut tree, &mut pool, &[4, 4, 4, 4, 4]);
        assert_eq!(tree.len(), 5);
        assert!(tree.check().is_ok());
        let keys: Vec<u64> = tree.in_order().into_iter().map(|n| tree.key(n)).collect();
        assert_eq!(keys, vec![4; 5]);
    }

    #[test]
    fn deleting_everything_leaves_empty_tree() {
        let mut pool = Pool::new(16);
        let mut tree = RbTree::new();
        let keys: Vec<u64> = (0..16).map(|i| (i * 7) % 16).collect();
        let nodes = insert_all(&mut tree, &mut pool, &keys);
        for (i, node) in nodes.iter().enumerate() {
            // SAFETY: every node is linked exactly once.
            unsafe { tree.delete(*node) };
            assert!(tree.check().is_ok(), "invalid after deleting #{i}");
            assert_eq!(tree.len(), 15 - i);
        }
        assert!(tree.is_empty());
    }
}
