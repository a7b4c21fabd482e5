//! Heap error types.

use arenaheap_index::IndexViolation;
use thiserror::Error;

/// Recoverable failure while creating or attaching a heap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("arena of {size} bytes exceeds the {max}-byte limit of 31-bit offsets")]
    ArenaTooLarge { size: usize, max: usize },
    #[error("arena of {size} bytes cannot hold the {min}-byte bootstrap record")]
    ArenaTooSmall { size: usize, min: usize },
    #[error("arena does not hold an initialized heap: {reason}")]
    NotInitialized { reason: &'static str },
    #[error("arena image is inconsistent: {0}")]
    Corrupt(#[from] IntegrityError),
}

pub type HeapResult<T> = Result<T, HeapError>;

/// Inconsistency found by `verify()`. Offsets are relative to the arena start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("{index} index: {source}")]
    Index {
        index: &'static str,
        #[source]
        source: IndexViolation,
    },
    #[error("span at {offset:#x} does not start where the previous one ends ({expected:#x})")]
    Tiling { offset: usize, expected: usize },
    #[error("spans cover {end:#x} bytes of a {arena_size:#x}-byte arena")]
    Coverage { end: usize, arena_size: usize },
    #[error("free record of span {offset:#x}: {reason}")]
    FreeRecord { offset: usize, reason: &'static str },
    #[error("{reachable} free blocks reachable through the free index, {expected} spans have trailing free space")]
    FreeCount { reachable: usize, expected: usize },
}
