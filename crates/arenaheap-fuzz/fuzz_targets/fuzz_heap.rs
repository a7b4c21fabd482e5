#![no_main]
use arenaheap_core::{FatalPolicy, HeapConfig, RelocatableHeap};
use libfuzzer_sys::fuzz_target;

const ARENA: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: op, size (u16 LE), alignment shift.
    if data.len() < 4 {
        return;
    }

    let mut mem = vec![0u8; ARENA];
    let config = HeapConfig::default().with_fatal(FatalPolicy::Panic);
    let mut heap = RelocatableHeap::init(&mut mem, config).expect("arena fits");
    let mut live = Vec::new();

    for chunk in data.chunks_exact(4) {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        match chunk[0] % 4 {
            0 => {
                if let Some(b) = heap.allocate(size) {
                    live.push(b);
                }
            }
            1 => {
                let align = 1usize << (chunk[3] % 13);
                if let Some(b) = heap.allocate_aligned(size, align) {
                    assert_eq!(b.as_usize() % align, 0);
                    live.push(b);
                }
            }
            2 => {
                if !live.is_empty() {
                    let b = live.swap_remove(chunk[3] as usize % live.len());
                    heap.release(b);
                }
            }
            _ => {
                if let Some(&b) = live.last() {
                    let payload = heap.payload_mut(b).expect("live block");
                    assert!(!payload.is_empty());
                    payload.fill(chunk[3]);
                }
            }
        }
        assert_eq!(heap.bytes_allocated() + heap.bytes_available(false), ARENA);
    }
    heap.verify().expect("heap consistent");

    for b in live {
        heap.release(b);
    }
    heap.verify().expect("heap consistent");
    assert_eq!(heap.stats().free_blocks, 1);
});
