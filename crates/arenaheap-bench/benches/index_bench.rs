//! Ordered index benchmarks.

use std::ptr::{self, NonNull};

use arenaheap_index::compact::NODE_SIZE;
use arenaheap_index::{CompactTree, IndexRead, Offset, RbNode, RbTree};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn keys(n: usize) -> Vec<u32> {
    let mut state = 0x9e37_79b9_u32;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state & 0x00ff_ffff
        })
        .collect()
}

fn bench_insert_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_insert_delete");

    for n in [64usize, 1024, 16384] {
        let ks = keys(n);

        let mut nodes: Vec<RbNode> = (0..n).map(|_| RbNode::new()).collect();
        let base = nodes.as_mut_ptr();
        group.bench_with_input(BenchmarkId::new("native", n), &ks, |b, ks| {
            b.iter(|| {
                let mut tree = RbTree::new();
                for (i, &k) in ks.iter().enumerate() {
                    let node = NonNull::new(base.wrapping_add(i)).expect("non-null");
                    // SAFETY: `nodes` outlives the tree and each node is linked once.
                    unsafe { tree.insert(u64::from(k), ptr::null_mut(), node) };
                }
                criterion::black_box(tree.min());
                for i in 0..ks.len() {
                    let node = NonNull::new(base.wrapping_add(i)).expect("non-null");
                    // SAFETY: every node was inserted above.
                    unsafe { tree.delete(node) };
                }
            });
        });

        let mut mem = vec![0u8; 8 + NODE_SIZE + n * NODE_SIZE];
        group.bench_with_input(BenchmarkId::new("compact", n), &ks, |b, ks| {
            b.iter(|| {
                let tree = CompactTree::init(&mut mem, Offset::new(0), Offset::new(4));
                let node = |i: usize| Offset::new((4 + NODE_SIZE + i * NODE_SIZE) as u32);
                let mut view = tree.view(&mut mem);
                for (i, &k) in ks.iter().enumerate() {
                    view.insert(k, Offset::new(0), node(i));
                }
                for i in 0..ks.len() {
                    view.delete(node(i));
                }
                criterion::black_box(tree.read(&mem).min());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert_delete);
criterion_main!(benches);
