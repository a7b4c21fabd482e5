//! # arenaheap-core
//!
//! Heap memory manager that carves variable-sized blocks out of a flat arena
//! supplied by the caller. All bookkeeping (headers, both indices and, for the
//! relocatable variant, the index roots) lives inside the arena itself.
//!
//! Free space is found through an ordered index keyed by block size; the
//! physically preceding span of a released block is found through a second
//! index keyed by address, and the released span is folded into it.
//!
//! - [`NativeHeap`]: absolute addresses over a raw arena pointer.
//! - [`RelocatableHeap`]: 32-bit offsets over a `&mut [u8]`; the arena image
//!   can be copied, persisted or mapped elsewhere and re-attached.
//! - [`LockedHeap`]: either variant behind one coarse lock.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod heap;
pub mod locked;
pub mod log;

pub use config::{FatalPolicy, HeapConfig};
pub use error::{HeapError, HeapResult, IntegrityError};
pub use heap::{ArenaAllocator, HeapStats, NativeHeap, RelocatableHeap, SpanInfo, SpanKind};
pub use locked::LockedHeap;
pub use log::{HeapLogRecord, LogLevel};

pub use arenaheap_index::Offset;
