//! Structural scenarios run against both link representations.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use arenaheap_index::compact::NODE_SIZE;
use arenaheap_index::{
    Color, CompactTree, CompactView, IndexRead, IndexWrite, Offset, RbNode, RbTree,
};

trait Harness {
    type Tree: IndexWrite;

    fn tree(&mut self) -> &mut Self::Tree;
    fn node(&self, i: usize) -> <Self::Tree as IndexRead>::Ref;
    fn insert(&mut self, i: usize, key: u64);
    fn delete(&mut self, i: usize);

    fn keys(&mut self) -> Vec<u64> {
        let tree = self.tree();
        tree.in_order().into_iter().map(|n| tree.key(n)).collect()
    }
}

struct Native {
    tree: RbTree,
    base: *mut RbNode,
    len: usize,
}

impl Native {
    fn new(len: usize) -> Self {
        let nodes: &'static mut [RbNode] =
            Box::leak((0..len).map(|_| RbNode::new()).collect::<Box<[_]>>());
        Self {
            tree: RbTree::new(),
            base: nodes.as_mut_ptr(),
            len,
        }
    }
}

impl Harness for Native {
    type Tree = RbTree;

    fn tree(&mut self) -> &mut RbTree {
        &mut self.tree
    }

    fn node(&self, i: usize) -> NonNull<RbNode> {
        assert!(i < self.len);
        NonNull::new(self.base.wrapping_add(i)).unwrap()
    }

    fn insert(&mut self, i: usize, key: u64) {
        let node = self.node(i);
        // SAFETY: node storage is leaked for the life of the test.
        unsafe { self.tree.insert(key, ptr::null_mut(), node) };
    }

    fn delete(&mut self, i: usize) {
        let node = self.node(i);
        // SAFETY: callers only delete nodes they inserted.
        unsafe { self.tree.delete(node) };
    }
}

struct Compact {
    view: CompactView<'static>,
}

const NODES_AT: u32 = 24;

impl Compact {
    fn new(len: usize) -> Self {
        let mem: &'static mut [u8] =
            Box::leak(vec![0u8; NODES_AT as usize + len * NODE_SIZE].into_boxed_slice());
        // Sentinel at offset 0, root slot right after it.
        let tree = CompactTree::init(mem, Offset::new(20), Offset::new(0));
        Self {
            view: tree.view(mem),
        }
    }
}

impl Harness for Compact {
    type Tree = CompactView<'static>;

    fn tree(&mut self) -> &mut CompactView<'static> {
        &mut self.view
    }

    fn node(&self, i: usize) -> Offset {
        Offset::new(NODES_AT + (i * NODE_SIZE) as u32)
    }

    fn insert(&mut self, i: usize, key: u64) {
        let node = self.node(i);
        self.view.insert(key as u32, Offset::new(0), node);
    }

    fn delete(&mut self, i: usize) {
        let node = self.node(i);
        self.view.delete(node);
    }
}

struct XorShift64(u64);

impl XorShift64 {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn rotations_and_structured_deletes<H: Harness>(h: &mut H) {
    for (i, k) in [3, 5, 2].into_iter().enumerate() {
        h.insert(i, k);
    }
    let n = |i| h.node(i);
    let (n0, n1, n2) = (n(0), n(1), n(2));
    {
        let t = h.tree();
        assert_eq!(t.root(), n0);
        assert_eq!(t.right(n0), n1);
        assert_eq!(t.left(n0), n2);

        let root = t.root();
        t.left_rotate(root);
        assert_eq!(t.root(), n1);
        assert_eq!(t.left(n1), n0);
        assert_eq!(t.left(n0), n2);

        let root = t.root();
        t.right_rotate(root);
        assert_eq!(t.root(), n0);
        assert_eq!(t.right(n0), n1);
        assert_eq!(t.left(n0), n2);

        t.right_rotate(n0);
        assert_eq!(t.root(), n2);
        assert_eq!(t.right(n2), n0);
        assert_eq!(t.right(n0), n1);

        let root = t.root();
        t.left_rotate(root);
        assert_eq!(t.root(), n0);
        assert!(t.check().is_ok());
    }

    for (i, k) in [(3, 17), (4, 1), (5, 13)] {
        h.insert(i, k);
    }
    let (n3, n4, n5) = (h.node(3), h.node(4), h.node(5));
    {
        let t = h.tree();
        assert_eq!(t.root(), n0);
        assert_eq!(t.left(n0), n2);
        assert_eq!(t.right(n0), n5);
        assert_eq!(t.left(n2), n4);
        assert_eq!(t.left(n5), n1);
        assert_eq!(t.right(n5), n3);
        assert!(t.check().is_ok());
    }

    h.delete(5);
    {
        let t = h.tree();
        let r = t.right(t.root());
        assert_eq!(r, n3);
        assert_eq!(t.color(n3), Color::Black);
        assert_eq!(t.left(n3), n1);
        assert_eq!(t.color(n1), Color::Red);
    }

    h.delete(0);
    assert_eq!(h.tree().root(), n1);
    assert!(h.tree().check().is_ok());
    assert_eq!(h.keys(), vec![1, 2, 5, 17]);
}

fn deleting_roots_of_small_trees<H: Harness>(h: &mut H) {
    h.insert(0, 7);
    h.delete(0);
    assert!(h.tree().is_empty());

    for (i, k) in [3, 1, 5].into_iter().enumerate() {
        h.insert(i, k);
    }
    let (n1, n2) = (h.node(1), h.node(2));
    h.delete(0);
    {
        let t = h.tree();
        assert_eq!(t.root(), n2);
        assert_eq!(t.left(n2), n1);
        assert_eq!(t.color(n2), Color::Black);
    }
    h.delete(1);
    {
        let t = h.tree();
        assert_eq!(t.root(), n2);
        assert!(t.is_nil(t.left(n2)));
        assert!(t.is_nil(t.right(n2)));
        assert!(t.check().is_ok());
    }
    h.delete(2);
    assert!(h.tree().is_empty());
}

fn neighbor_queries<H: Harness>(h: &mut H) {
    for (i, k) in [1, 3, 5, 7, 9].into_iter().enumerate() {
        h.insert(i, k);
    }
    let t = h.tree();
    let key = |n: Option<<H::Tree as IndexRead>::Ref>| n.map(|n| t.key(n));

    assert_eq!(key(t.min()), Some(1));
    assert_eq!(key(t.max()), Some(9));

    let mut up = Vec::new();
    let mut cur = t.min();
    while let Some(n) = cur {
        up.push(t.key(n));
        cur = t.next_larger(n);
    }
    assert_eq!(up, vec![1, 3, 5, 7, 9]);

    let mut down = Vec::new();
    let mut cur = t.max();
    while let Some(n) = cur {
        down.push(t.key(n));
        cur = t.next_smaller(n);
    }
    assert_eq!(down, vec![9, 7, 5, 3, 1]);

    assert_eq!(key(t.min_at_least(6)), Some(7));
    assert_eq!(key(t.max_at_most(6)), Some(5));
    assert_eq!(key(t.min_at_least(0)), Some(1));
    assert_eq!(key(t.max_at_most(9)), Some(9));
    assert_eq!(key(t.min_at_least(10)), None);
    assert_eq!(key(t.max_at_most(0)), None);
    assert_eq!(key(t.search(7)), Some(7));
    assert_eq!(key(t.search(4)), None);
}

fn transplant_replaces_subtree<H: Harness>(h: &mut H) {
    for (i, k) in [3, 5, 2].into_iter().enumerate() {
        h.insert(i, k);
    }
    let n1 = h.node(1);
    let t = h.tree();
    let root = t.root();
    let nil = t.nil();
    t.transplant(n1, nil);
    assert!(t.is_nil(t.right(root)));
    assert_eq!(t.len(), 2);
}

fn randomized_trace_matches_sorted_model<H: Harness>(h: &mut H, slots: usize, seed: u64) {
    let mut rng = XorShift64(seed);
    let mut linked: Vec<Option<u64>> = vec![None; slots];
    for step in 0..2_000 {
        let slot = (rng.next() % slots as u64) as usize;
        match linked[slot] {
            Some(_) => {
                h.delete(slot);
                linked[slot] = None;
            }
            None => {
                let key = rng.next() % 64;
                h.insert(slot, key);
                linked[slot] = Some(key);
            }
        }
        let check = h.tree().check();
        assert!(check.is_ok(), "seed={seed} step={step}: {check:?}");
        if step % 50 == 0 {
            let mut model: Vec<u64> = linked.iter().flatten().copied().collect();
            model.sort_unstable();
            assert_eq!(h.keys(), model, "seed={seed} step={step}");
        }
    }
}

#[test]
fn native_rotations_and_structured_deletes() {
    rotations_and_structured_deletes(&mut Native::new(6));
}

#[test]
fn compact_rotations_and_structured_deletes() {
    rotations_and_structured_deletes(&mut Compact::new(6));
}

#[test]
fn native_deleting_roots_of_small_trees() {
    deleting_roots_of_small_trees(&mut Native::new(3));
}

#[test]
fn compact_deleting_roots_of_small_trees() {
    deleting_roots_of_small_trees(&mut Compact::new(3));
}

#[test]
fn native_neighbor_queries() {
    neighbor_queries(&mut Native::new(5));
}

#[test]
fn compact_neighbor_queries() {
    neighbor_queries(&mut Compact::new(5));
}

#[test]
fn native_transplant_replaces_subtree() {
    transplant_replaces_subtree(&mut Native::new(3));
}

#[test]
fn compact_transplant_replaces_subtree() {
    transplant_replaces_subtree(&mut Compact::new(3));
}

#[test]
fn native_randomized_trace_matches_sorted_model() {
    for seed in [0x9e37_79b9_7f4a_7c15, 0xdead_beef_cafe_f00d, 7] {
        randomized_trace_matches_sorted_model(&mut Native::new(64), 64, seed);
    }
}

#[test]
fn compact_randomized_trace_matches_sorted_model() {
    for seed in [0x9e37_79b9_7f4a_7c15, 0xdead_beef_cafe_f00d, 7] {
        randomized_trace_matches_sorted_model(&mut Compact::new(64), 64, seed);
    }
}

#[test]
fn dot_export_lists_nodes_edges_and_null_points() {
    let mut h = Compact::new(3);
    for (i, k) in [0x30, 0x10, 0x50].into_iter().enumerate() {
        h.insert(i, k);
    }
    let dot = h.tree().to_dot();
    assert!(dot.starts_with("digraph index {"));
    assert!(dot.contains("label=\"0x30\" color=black"));
    assert!(dot.contains("label=\"0x10\" color=red"));
    assert_eq!(dot.matches("shape=point").count(), 4);
    assert!(dot.trim_end().ends_with('}'));
}
