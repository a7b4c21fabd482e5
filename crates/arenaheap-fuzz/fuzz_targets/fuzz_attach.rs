#![no_main]
use arenaheap_core::{FatalPolicy, HeapConfig, RelocatableHeap};
use libfuzzer_sys::fuzz_target;

const ARENA: usize = 32 * 1024;

fuzz_target!(|data: &[u8]| {
    // Build an image from an operation trace, move it, and reopen it.
    let config = HeapConfig::default().with_fatal(FatalPolicy::Panic);
    let mut mem = vec![0u8; ARENA];
    let (stats, live) = {
        let mut heap = RelocatableHeap::init(&mut mem, config).expect("arena fits");
        let mut live = Vec::new();
        for pair in data.chunks_exact(2) {
            if pair[0] & 1 == 0 {
                if let Some(b) = heap.allocate(usize::from(pair[1]) * 4 + 1) {
                    heap.payload_mut(b).expect("live block").fill(pair[1]);
                    live.push((b, pair[1]));
                }
            } else if !live.is_empty() {
                let (b, _) = live.swap_remove(usize::from(pair[1]) % live.len());
                heap.release(b);
            }
        }
        (heap.stats(), live)
    };

    let mut moved = mem.clone();
    drop(mem);
    let mut heap = RelocatableHeap::attach(&mut moved, config).expect("image reattaches");
    assert_eq!(heap.stats(), stats);
    for (b, byte) in live {
        assert!(heap.payload(b).expect("live block").iter().all(|&x| x == byte));
        heap.release(b);
    }
    heap.verify().expect("heap consistent");
});
