//! # arenaheap-index
//!
//! Intrusive red-black ordered index keyed by an unsigned integer.
//!
//! The algorithms (insert and delete with rebalancing, rotations, neighbor
//! queries, ordered iteration) are written once against the [`IndexRead`] and
//! [`IndexWrite`] traits. Two link representations implement them:
//!
//! - [`native::RbTree`]: links are raw node pointers, node storage is owned by
//!   the caller.
//! - [`compact::CompactView`]: links are 32-bit [`Offset`]s into a byte arena,
//!   so a tree stored this way stays valid after the arena is copied or mapped
//!   at another address.
//!
//! Both forms use a per-tree black sentinel ("nil") in place of null links.
//! Duplicate keys are allowed; an equal key descends to the right on insert.

#![deny(unsafe_code)]

mod check;
pub mod compact;
mod dot;
pub mod native;

pub use check::IndexViolation;
pub use compact::{CompactRef, CompactTree, CompactView, Offset};
pub use native::{RbNode, RbTree};

/// Node color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Color {
    Red = 0,
    Black = 1,
}

/// Read access to the links of an ordered index, plus every query that only
/// needs to follow them.
pub trait IndexRead {
    /// Node handle. Equality is node identity.
    type Ref: Copy + Eq + std::fmt::Debug;

    fn nil(&self) -> Self::Ref;
    fn root(&self) -> Self::Ref;
    fn key(&self, node: Self::Ref) -> u64;
    fn color(&self, node: Self::Ref) -> Color;
    fn left(&self, node: Self::Ref) -> Self::Ref;
    fn right(&self, node: Self::Ref) -> Self::Ref;
    fn parent(&self, node: Self::Ref) -> Self::Ref;

    #[inline]
    fn is_nil(&self, node: Self::Ref) -> bool {
        node == self.nil()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.is_nil(self.root())
    }

    /// Leftmost node of the subtree rooted at `node` (non-nil).
    fn subtree_min(&self, mut node: Self::Ref) -> Self::Ref {
        loop {
            let l = self.left(node);
            if self.is_nil(l) {
                return node;
            }
            node = l;
        }
    }

    /// Rightmost node of the subtree rooted at `node` (non-nil).
    fn subtree_max(&self, mut node: Self::Ref) -> Self::Ref {
        loop {
            let r = self.right(node);
            if self.is_nil(r) {
                return node;
            }
            node = r;
        }
    }

    /// Exact-match descent; returns the first node on the path whose key
    /// equals `key`.
    fn search(&self, key: u64) -> Option<Self::Ref> {
        let mut x = self.root();
        while !self.is_nil(x) {
            let k = self.key(x);
            if key == k {
                return Some(x);
            }
            x = if key < k { self.left(x) } else { self.right(x) };
        }
        None
    }

    fn min(&self) -> Option<Self::Ref> {
        let root = self.root();
        (!self.is_nil(root)).then(|| self.subtree_min(root))
    }

    fn max(&self) -> Option<Self::Ref> {
        let root = self.root();
        (!self.is_nil(root)).then(|| self.subtree_max(root))
    }

    /// In-order successor of `node`.
    fn next_larger(&self, node: Self::Ref) -> Option<Self::Ref> {
        let r = self.right(node);
        if !self.is_nil(r) {
            return Some(self.subtree_min(r));
        }
        let mut x = node;
        let mut y = self.parent(x);
        while !self.is_nil(y) && x == self.right(y) {
            x = y;
            y = self.parent(y);
        }
        (!self.is_nil(y)).then_some(y)
    }

    /// In-order predecessor of `node`.
    fn next_smaller(&self, node: Self::Ref) -> Option<Self::Ref> {
        let l = self.left(node);
        if !self.is_nil(l) {
            return Some(self.subtree_max(l));
        }
        let mut x = node;
        let mut y = self.parent(x);
        while !self.is_nil(y) && x == self.left(y) {
            x = y;
            y = self.parent(y);
        }
        (!self.is_nil(y)).then_some(y)
    }

    /// Smallest node with key `>= key`.
    ///
    /// Walks from the overall minimum through successors, so the cost is
    /// linear in the number of smaller keys.
    fn min_at_least(&self, key: u64) -> Option<Self::Ref> {
        let mut cur = self.min();
        while let Some(n) = cur {
            if self.key(n) >= key {
                return Some(n);
            }
            cur = self.next_larger(n);
        }
        None
    }

    /// Largest node with key `<= key`, walking down from the overall maximum.
    fn max_at_most(&self, key: u64) -> Option<Self::Ref> {
        let mut cur = self.max();
        while let Some(n) = cur {
            if self.key(n) <= key {
                return Some(n);
            }
            cur = self.next_smaller(n);
        }
        None
    }

    /// Visit every node once in non-decreasing key order.
    fn for_each_in_order(&self, mut visit: impl FnMut(Self::Ref)) {
        let mut stack = Vec::new();
        let mut x = self.root();
        loop {
            while !self.is_nil(x) {
                stack.push(x);
                x = self.left(x);
            }
            let Some(n) = stack.pop() else {
                break;
            };
            visit(n);
            x = self.right(n);
        }
    }

    fn in_order(&self) -> Vec<Self::Ref> {
        let mut out = Vec::new();
        self.for_each_in_order(|n| out.push(n));
        out
    }

    fn len(&self) -> usize {
        let mut n = 0;
        self.for_each_in_order(|_| n += 1);
        n
    }

    /// Validate the red-black invariants, parent links and key order.
    ///
    /// Returns the black height of the tree.
    fn check(&self) -> Result<usize, IndexViolation> {
        check::validate(self)
    }

    /// Render the tree as a Graphviz digraph.
    fn to_dot(&self) -> String {
        dot::render(self)
    }
}

/// Link mutation plus the rebalancing algorithms built on it.
///
/// `set_parent` must accept the sentinel: deletion records the parent of a
/// displaced nil there.
pub trait IndexWrite: IndexRead {
    fn set_root(&mut self, node: Self::Ref);
    fn set_key(&mut self, node: Self::Ref, key: u64);
    fn set_color(&mut self, node: Self::Ref, color: Color);
    fn set_left(&mut self, node: Self::Ref, child: Self::Ref);
    fn set_right(&mut self, node: Self::Ref, child: Self::Ref);
    fn set_parent(&mut self, node: Self::Ref, parent: Self::Ref);

    fn left_rotate(&mut self, x: Self::Ref) {
        let y = self.right(x);
        let yl = self.left(y);
        self.set_right(x, yl);
        if !self.is_nil(yl) {
            self.set_parent(yl, x);
        }
        let xp = self.parent(x);
        self.set_parent(y, xp);
        if self.is_nil(xp) {
            self.set_root(y);
        } else if x == self.left(xp) {
            self.set_left(xp, y);
        } else {
            self.set_right(xp, y);
        }
        self.set_left(y, x);
        self.set_parent(x, y);
    }

    fn right_rotate(&mut self, x: Self::Ref) {
        let y = self.left(x);
        let yr = self.right(y);
        self.set_left(x, yr);
        if !self.is_nil(yr) {
            self.set_parent(yr, x);
        }
        let xp = self.parent(x);
        self.set_parent(y, xp);
        if self.is_nil(xp) {
            self.set_root(y);
        } else if x == self.right(xp) {
            self.set_right(xp, y);
        } else {
            self.set_left(xp, y);
        }
        self.set_right(y, x);
        self.set_parent(x, y);
    }

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: Self::Ref, v: Self::Ref) {
        let up = self.parent(u);
        if self.is_nil(up) {
            self.set_root(v);
        } else if u == self.left(up) {
            self.set_left(up, v);
        } else {
            self.set_right(up, v);
        }
        self.set_parent(v, up);
    }

    /// Link `z` into the tree under `key`. Only writes to `z` before reading
    /// it, so `z` may hold stale link data.
    fn link(&mut self, z: Self::Ref, key: u64) {
        let nil = self.nil();
        let mut y = nil;
        let mut x = self.root();
        while !self.is_nil(x) {
            y = x;
            x = if key < self.key(x) {
                self.left(x)
            } else {
                self.right(x)
            };
        }
        self.set_key(z, key);
        self.set_parent(z, y);
        if self.is_nil(y) {
            self.set_root(z);
        } else if key < self.key(y) {
            self.set_left(y, z);
        } else {
            self.set_right(y, z);
        }
        self.set_left(z, nil);
        self.set_right(z, nil);
        self.set_color(z, Color::Red);
        self.insert_fixup(z);
    }

    fn insert_fixup(&mut self, mut z: Self::Ref) {
        while self.color(self.parent(z)) == Color::Red {
            let p = self.parent(z);
            let g = self.parent(p);
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.left_rotate(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.right_rotate(g);
                }
            } else {
                let uncle = self.left(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.right_rotate(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.left_rotate(g);
                }
            }
        }
        let root = self.root();
        self.set_color(root, Color::Black);
    }

    /// Unlink `z`. A node with two children is replaced by its in-order
    /// successor. The links of `z` are reset to nil afterwards.
    fn unlink(&mut self, z: Self::Ref) {
        let nil = self.nil();
        let mut removed_color = self.color(z);
        let x;
        if self.is_nil(self.left(z)) {
            x = self.right(z);
            self.transplant(z, x);
        } else if self.is_nil(self.right(z)) {
            x = self.left(z);
            self.transplant(z, x);
        } else {
            let y = self.subtree_min(self.right(z));
            removed_color = self.color(y);
            x = self.right(y);
            if self.parent(y) == z {
                self.set_parent(x, y);
            } else {
                self.transplant(y, x);
                let zr = self.right(z);
                self.set_right(y, zr);
                self.set_parent(zr, y);
            }
            self.transplant(z, y);
            let zl = self.left(z);
            self.set_left(y, zl);
            self.set_parent(zl, y);
            let zc = self.color(z);
            self.set_color(y, zc);
        }
        if removed_color == Color::Black {
            self.delete_fixup(x);
        }
        self.set_left(z, nil);
        self.set_right(z, nil);
        self.set_parent(z, nil);
    }

    fn delete_fixup(&mut self, mut x: Self::Ref) {
        while x != self.root() && self.color(x) == Color::Black {
            let p = self.parent(x);
            if x == self.left(p) {
                let mut w = self.right(p);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.left_rotate(p);
                    w = self.right(self.parent(x));
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        let wl = self.left(w);
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.right_rotate(w);
                        w = self.right(self.parent(x));
                    }
                    let p = self.parent(x);
                    let pc = self.color(p);
                    self.set_color(w, pc);
                    self.set_color(p, Color::Black);
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.left_rotate(p);
                    x = self.root();
                }
            } else {
                let mut w = self.left(p);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.right_rotate(p);
                    w = self.left(self.parent(x));
                }
                if self.color(self.right(w)) == Color::Black
                    && self.color(self.left(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        let wr = self.right(w);
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.left_rotate(w);
                        w = self.left(self.parent(x));
                    }
                    let p = self.parent(x);
                    let pc = self.color(p);
                    self.set_color(w, pc);
                    self.set_color(p, Color::Black);
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.right_rotate(p);
                    x = self.root();
                }
            }
        }
        self.set_color(x, Color::Black);
    }
}
