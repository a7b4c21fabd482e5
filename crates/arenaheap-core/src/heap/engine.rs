//! Placement, splitting and coalescing, written once for both variants.
//!
//! Every span starts with a header and owns the free region that trails it up
//! to the next span (or the arena end). Spans therefore tile the arena with no
//! gaps. The free index holds one node per distinct free size; further free
//! regions of that size hang off the representative as a doubly linked chain.

use std::panic::Location;

use arenaheap_index::IndexViolation;

use super::{HeapStats, SpanInfo, SpanKind};
use crate::config::{FatalPolicy, HeapConfig};
use crate::error::IntegrityError;
use crate::log::{Event, HeapLogRecord, LifecycleLog, LogLevel};

/// Largest supported alignment; padding is stored in a 32-bit word.
pub(crate) const MAX_ALIGN: usize = 1 << 30;

/// Free region trailing a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeRecord<S> {
    /// This record is the free-index node for its size.
    pub in_tree: bool,
    pub base: usize,
    pub size: usize,
    pub next: Option<S>,
    pub prev: Option<S>,
}

impl<S> FreeRecord<S> {
    pub(crate) fn empty(base: usize) -> Self {
        Self {
            in_tree: false,
            base,
            size: 0,
            next: None,
            prev: None,
        }
    }
}

/// Header and index storage of one heap variant.
///
/// Addresses are in the variant's own address space: absolute for the native
/// heap, arena offsets for the relocatable one. A span handle identifies a
/// header; for every span except possibly the bootstrap, the header sits at
/// the span base.
pub(crate) trait SpanStore {
    type Span: Copy + Eq + std::fmt::Debug;

    const VARIANT: &'static str;
    const HEADER_SIZE: usize;
    const BOOTSTRAP_SIZE: usize;
    /// Largest span or free block the indices can key.
    const MAX_SPAN: usize;

    fn arena_start(&self) -> usize;
    fn arena_size(&self) -> usize;
    fn bootstrap(&self) -> Self::Span;
    /// Header handle for a header located at `addr`.
    fn span_at(&self, addr: usize) -> Self::Span;

    fn abase(&self, span: Self::Span) -> usize;
    fn asize(&self, span: Self::Span) -> usize;
    fn tag(&self, span: Self::Span) -> u32;
    /// Write the fixed header fields and an empty free record.
    fn write_header(&mut self, span: Self::Span, abase: usize, asize: usize, tag: u32);
    fn free_record(&self, span: Self::Span) -> FreeRecord<Self::Span>;
    fn set_free_record(&mut self, span: Self::Span, record: &FreeRecord<Self::Span>);
    /// The 32-bit word immediately before `payload`.
    fn padding(&self, payload: usize) -> u32;
    fn set_padding(&mut self, payload: usize, padding: u32);

    fn free_insert(&mut self, span: Self::Span, size: usize);
    fn free_delete(&mut self, span: Self::Span);
    fn free_key(&self, span: Self::Span) -> usize;
    fn free_search(&self, size: usize) -> Option<Self::Span>;
    fn free_min_at_least(&self, size: usize) -> Option<Self::Span>;
    fn free_next_larger(&self, span: Self::Span) -> Option<Self::Span>;
    fn free_max(&self) -> Option<Self::Span>;
    fn for_each_free(&self, visit: impl FnMut(Self::Span));
    fn free_check(&self) -> Result<usize, IndexViolation>;
    fn free_dot(&self) -> String;

    fn addr_insert(&mut self, span: Self::Span);
    fn addr_delete(&mut self, span: Self::Span);
    fn addr_prev(&self, span: Self::Span) -> Option<Self::Span>;
    fn for_each_span(&self, visit: impl FnMut(Self::Span));
    fn addr_check(&self) -> Result<usize, IndexViolation>;
    fn addr_dot(&self) -> String;
}

/// Tag for the caller of a `#[track_caller]` allocation entry point.
#[track_caller]
pub(crate) fn caller_tag(config: &HeapConfig) -> u32 {
    if config.tag_allocations {
        Location::caller().line()
    } else {
        0
    }
}

#[inline]
fn padding_for(addr: usize, align: usize) -> usize {
    addr.wrapping_neg() & (align - 1)
}

pub(crate) struct HeapCore<S: SpanStore> {
    store: S,
    config: HeapConfig,
    log: LifecycleLog,
    live: usize,
}

impl<S: SpanStore> HeapCore<S> {
    /// Write the bootstrap span and turn the rest of the arena into one free
    /// block. The store's indices must be empty.
    pub(crate) fn format(store: S, config: HeapConfig) -> Self {
        let mut core = Self {
            store,
            log: LifecycleLog::new(S::VARIANT, &config),
            config,
            live: 0,
        };
        let start = core.store.arena_start();
        let boot = core.store.bootstrap();
        core.store.write_header(boot, start, S::BOOTSTRAP_SIZE, 0);
        core.store.addr_insert(boot);
        let rest = core.store.arena_size() - S::BOOTSTRAP_SIZE;
        if rest > 0 {
            core.attach(boot, start + S::BOOTSTRAP_SIZE, rest);
        }
        core.log(Event {
            level: LogLevel::Info,
            symbol: "init",
            event: "arena_initialized",
            offset: Some(0),
            size: Some(core.store.arena_size()),
            align: None,
            outcome: "success",
            details: format!("free={rest}"),
        });
        core
    }

    /// Wrap a store whose arena already holds a formatted heap.
    pub(crate) fn resume(store: S, config: HeapConfig) -> Result<Self, IntegrityError> {
        let mut core = Self {
            store,
            log: LifecycleLog::new(S::VARIANT, &config),
            config,
            live: 0,
        };
        core.verify()?;
        let mut spans = 0usize;
        core.store.for_each_span(|_| spans += 1);
        core.live = spans.saturating_sub(1);
        core.log(Event {
            level: LogLevel::Info,
            symbol: "attach",
            event: "arena_attached",
            offset: Some(0),
            size: Some(core.store.arena_size()),
            align: None,
            outcome: "success",
            details: format!("live={}", core.live),
        });
        Ok(core)
    }

    pub(crate) fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub(crate) fn into_store(self) -> S {
        self.store
    }

    fn log(&mut self, event: Event) {
        self.log.record(event, self.live);
    }

    #[inline]
    fn rel(&self, addr: usize) -> usize {
        addr - self.store.arena_start()
    }

    fn fatal(&mut self, event: &'static str, payload: usize, details: String) -> ! {
        let offset = payload.wrapping_sub(self.store.arena_start());
        self.log(Event {
            level: LogLevel::Error,
            symbol: "release",
            event,
            offset: Some(offset),
            size: None,
            align: None,
            outcome: "fatal",
            details: details.clone(),
        });
        match self.config.fatal {
            FatalPolicy::Panic => {
                panic!("arenaheap: {event} at offset {offset:#x}: {details}")
            }
            FatalPolicy::Abort => {
                eprintln!(
                    "arenaheap: fatal {event} ({} heap) at offset {offset:#x}: {details}",
                    S::VARIANT
                );
                std::process::abort()
            }
        }
    }

    /// Take the free region of `span` out of the free index, promoting the
    /// next same-size region when `span` was the representative.
    fn detach(&mut self, span: S::Span) {
        let rec = self.store.free_record(span);
        if rec.in_tree {
            self.store.free_delete(span);
            if let Some(next) = rec.next {
                let mut promoted = self.store.free_record(next);
                promoted.in_tree = true;
                promoted.prev = None;
                self.store.set_free_record(next, &promoted);
                self.store.free_insert(next, promoted.size);
            }
        } else if rec.size > 0 {
            if let Some(prev) = rec.prev {
                let mut p = self.store.free_record(prev);
                p.next = rec.next;
                self.store.set_free_record(prev, &p);
            }
            if let Some(next) = rec.next {
                let mut n = self.store.free_record(next);
                n.prev = rec.prev;
                self.store.set_free_record(next, &n);
            }
        }
        self.store.set_free_record(span, &FreeRecord::empty(rec.base));
    }

    /// Give `span` a trailing free region and index it.
    fn attach(&mut self, span: S::Span, base: usize, size: usize) {
        let mut rec = FreeRecord {
            in_tree: false,
            base,
            size,
            next: None,
            prev: None,
        };
        match self.store.free_search(size) {
            Some(rep) => {
                let mut r = self.store.free_record(rep);
                rec.prev = Some(rep);
                rec.next = r.next;
                if let Some(next) = r.next {
                    let mut n = self.store.free_record(next);
                    n.prev = Some(span);
                    self.store.set_free_record(next, &n);
                }
                r.next = Some(span);
                self.store.set_free_record(rep, &r);
                self.store.set_free_record(span, &rec);
            }
            None => {
                rec.in_tree = true;
                self.store.set_free_record(span, &rec);
                self.store.free_insert(span, size);
            }
        }
    }

    /// Extend the trailing free region of `span` by `extra` bytes.
    fn grow(&mut self, span: S::Span, extra: usize) {
        let total = self.store.free_record(span).size + extra;
        self.detach(span);
        if total > 0 {
            let base = self.store.abase(span) + self.store.asize(span);
            self.attach(span, base, total);
        }
    }

    pub(crate) fn allocate(&mut self, size: usize, align: usize, tag: u32) -> Option<usize> {
        if size == 0 {
            self.log(Event {
                level: LogLevel::Debug,
                symbol: "allocate",
                event: "alloc_zero_size",
                offset: None,
                size: Some(0),
                align: Some(align),
                outcome: "ignored",
                details: String::new(),
            });
            return None;
        }
        let align = align.max(1);
        if !align.is_power_of_two() || align > MAX_ALIGN {
            self.log(Event {
                level: LogLevel::Warn,
                symbol: "allocate",
                event: "alloc_invalid_alignment",
                offset: None,
                size: Some(size),
                align: Some(align),
                outcome: "denied",
                details: String::new(),
            });
            return None;
        }

        let header = S::HEADER_SIZE;
        let required = size
            .checked_add(header)
            .filter(|&r| r <= S::MAX_SPAN);
        let mut candidate = required.and_then(|r| self.store.free_min_at_least(r));
        let mut skipped = 0usize;
        let (owner, block, padding) = loop {
            let (Some(span), Some(required)) = (candidate, required) else {
                let largest = self.max_free_block();
                self.log(Event {
                    level: LogLevel::Warn,
                    symbol: "allocate",
                    event: "alloc",
                    offset: None,
                    size: Some(size),
                    align: Some(align),
                    outcome: "oom",
                    details: format!("max_free_block={largest}"),
                });
                return None;
            };
            let rec = self.store.free_record(span);
            let padding = padding_for(rec.base + header, align);
            if rec.size >= required + padding {
                break (span, rec, padding);
            }
            skipped += 1;
            candidate = self.store.free_next_larger(span);
        };
        if skipped > 0 {
            self.log(Event {
                level: LogLevel::Debug,
                symbol: "allocate",
                event: "alignment_search",
                offset: Some(self.rel(block.base)),
                size: Some(size),
                align: Some(align),
                outcome: "success",
                details: format!("skipped={skipped}"),
            });
        }

        let span_size = size + header + padding;
        self.detach(owner);
        let span = self.store.span_at(block.base);
        self.store.write_header(span, block.base, span_size, tag);
        if block.size > span_size {
            self.attach(span, block.base + span_size, block.size - span_size);
        }
        self.store.addr_insert(span);
        let payload = block.base + header + padding;
        // `padding < align <= MAX_ALIGN` fits in the word.
        self.store.set_padding(payload, padding as u32);
        self.live += 1;

        if self.log.enabled(LogLevel::Trace) {
            self.log(Event {
                level: LogLevel::Trace,
                symbol: "allocate",
                event: "alloc",
                offset: Some(self.rel(payload)),
                size: Some(size),
                align: Some(align),
                outcome: "success",
                details: format!("span={span_size};padding={padding};tag={tag}"),
            });
        }
        Some(payload)
    }

    /// Header of the live block whose payload is `payload`, if the header
    /// recovered through the padding word is plausible.
    pub(crate) fn header_of(&self, payload: usize) -> Option<S::Span> {
        let start = self.store.arena_start();
        let end = start + self.store.arena_size();
        let first_payload = start + S::BOOTSTRAP_SIZE + S::HEADER_SIZE;
        if payload < first_payload || payload > end {
            return None;
        }
        let padding = self.store.padding(payload) as usize;
        let addr = payload.checked_sub(S::HEADER_SIZE + padding)?;
        if addr < start + S::BOOTSTRAP_SIZE {
            return None;
        }
        let span = self.store.span_at(addr);
        let asize = self.store.asize(span);
        let plausible = self.store.abase(span) == addr
            && asize >= S::HEADER_SIZE + padding
            && asize <= end - addr;
        plausible.then_some(span)
    }

    pub(crate) fn release(&mut self, payload: usize) {
        let Some(span) = self.header_of(payload) else {
            self.fatal(
                "release_unknown_block",
                payload,
                "no live header behind payload".to_string(),
            );
        };
        let Some(pred) = self.store.addr_prev(span) else {
            self.fatal(
                "release_without_predecessor",
                payload,
                "address index has no span before this block".to_string(),
            );
        };
        let asize = self.store.asize(span);
        let trailing = self.store.free_record(span).size;
        self.detach(span);
        self.store.addr_delete(span);
        // Clear the base so a second release of this payload is caught.
        self.store.write_header(span, 0, 0, 0);
        self.grow(pred, asize + trailing);
        self.live = self.live.saturating_sub(1);

        if self.log.enabled(LogLevel::Trace) {
            let into = self.rel(self.store.abase(pred));
            self.log(Event {
                level: LogLevel::Trace,
                symbol: "release",
                event: "free",
                offset: Some(self.rel(payload)),
                size: Some(asize),
                align: None,
                outcome: "success",
                details: format!("coalesced_into={into:#x};merged={}", asize + trailing),
            });
        }
    }

    pub(crate) fn usable_size(&self, payload: usize) -> Option<usize> {
        let span = self.header_of(payload)?;
        let padding = self.store.padding(payload) as usize;
        Some(self.store.asize(span) - S::HEADER_SIZE - padding)
    }

    pub(crate) fn tag_of(&self, payload: usize) -> Option<u32> {
        let span = self.header_of(payload)?;
        let tag = self.store.tag(span);
        (tag != 0).then_some(tag)
    }

    pub(crate) fn max_free_block(&self) -> usize {
        self.store
            .free_max()
            .map_or(0, |s| self.store.free_key(s).saturating_sub(S::HEADER_SIZE))
    }

    /// Visit every free region, representatives and chain members alike.
    fn for_each_free_block(&self, mut visit: impl FnMut(&FreeRecord<S::Span>)) {
        self.store.for_each_free(|rep| {
            let mut cur = Some(rep);
            while let Some(span) = cur {
                let rec = self.store.free_record(span);
                visit(&rec);
                cur = rec.next;
            }
        });
    }

    pub(crate) fn bytes_available(&self, net: bool) -> usize {
        let mut total = 0usize;
        self.for_each_free_block(|rec| {
            total += if net {
                rec.size.saturating_sub(S::HEADER_SIZE)
            } else {
                rec.size
            };
        });
        total
    }

    pub(crate) fn bytes_allocated(&self) -> usize {
        let mut total = 0usize;
        self.store
            .for_each_span(|span| total += self.store.asize(span));
        total
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_size: self.store.arena_size(),
            header_size: S::HEADER_SIZE,
            bootstrap_size: S::BOOTSTRAP_SIZE,
            bytes_allocated: self.bytes_allocated(),
            max_free_block: self.max_free_block(),
            live_allocations: self.live,
            ..HeapStats::default()
        };
        self.for_each_free_block(|rec| {
            stats.bytes_available += rec.size;
            stats.bytes_available_net += rec.size.saturating_sub(S::HEADER_SIZE);
            stats.free_blocks += 1;
        });
        self.store.for_each_free(|_| stats.distinct_free_sizes += 1);
        stats
    }

    pub(crate) fn spans(&self) -> Vec<SpanInfo> {
        let boot = self.store.bootstrap();
        let mut out = Vec::new();
        self.store.for_each_span(|span| {
            let (kind, tag) = if span == boot {
                (SpanKind::Bootstrap, None)
            } else {
                let tag = self.store.tag(span);
                (SpanKind::Allocated, (tag != 0).then_some(tag))
            };
            out.push(SpanInfo {
                kind,
                offset: self.rel(self.store.abase(span)),
                len: self.store.asize(span),
                tag,
            });
            let rec = self.store.free_record(span);
            if rec.size > 0 {
                out.push(SpanInfo {
                    kind: SpanKind::Free,
                    offset: self.rel(rec.base),
                    len: rec.size,
                    tag: None,
                });
            }
        });
        out
    }

    pub(crate) fn verify(&self) -> Result<(), IntegrityError> {
        self.store
            .addr_check()
            .map_err(|source| IntegrityError::Index {
                index: "address",
                source,
            })?;
        self.store
            .free_check()
            .map_err(|source| IntegrityError::Index {
                index: "free",
                source,
            })?;

        let start = self.store.arena_start();
        let mut spans = Vec::new();
        self.store.for_each_span(|s| spans.push(s));

        let mut expected = start;
        let mut with_free = 0usize;
        for &span in &spans {
            let abase = self.store.abase(span);
            if abase != expected {
                return Err(IntegrityError::Tiling {
                    offset: abase.wrapping_sub(start),
                    expected: expected - start,
                });
            }
            let end = abase + self.store.asize(span);
            let rec = self.store.free_record(span);
            if rec.size > 0 {
                if rec.base != end {
                    return Err(IntegrityError::FreeRecord {
                        offset: abase - start,
                        reason: "free region does not follow its span",
                    });
                }
                with_free += 1;
            } else if rec.in_tree || rec.next.is_some() || rec.prev.is_some() {
                return Err(IntegrityError::FreeRecord {
                    offset: abase - start,
                    reason: "empty record is still linked",
                });
            }
            expected = end + rec.size;
        }
        let arena_size = self.store.arena_size();
        if expected != start + arena_size {
            return Err(IntegrityError::Coverage {
                end: expected - start,
                arena_size,
            });
        }

        let mut reps = Vec::new();
        self.store.for_each_free(|s| reps.push(s));
        let mut reachable = 0usize;
        let mut last_key = None;
        for &rep in &reps {
            let rec = self.store.free_record(rep);
            let offset = self.store.abase(rep) - start;
            let key = self.store.free_key(rep);
            if !rec.in_tree || key != rec.size || rec.prev.is_some() {
                return Err(IntegrityError::FreeRecord {
                    offset,
                    reason: "index node disagrees with its record",
                });
            }
            if last_key == Some(key) {
                return Err(IntegrityError::FreeRecord {
                    offset,
                    reason: "size indexed twice",
                });
            }
            last_key = Some(key);
            reachable += 1;

            let mut prev = rep;
            let mut cur = rec.next;
            while let Some(member) = cur {
                let m = self.store.free_record(member);
                let offset = self.store.abase(member).wrapping_sub(start);
                if m.in_tree || m.size != rec.size || m.prev != Some(prev) {
                    return Err(IntegrityError::FreeRecord {
                        offset,
                        reason: "chain member is inconsistent",
                    });
                }
                reachable += 1;
                if reachable > with_free {
                    return Err(IntegrityError::FreeCount {
                        reachable,
                        expected: with_free,
                    });
                }
                prev = member;
                cur = m.next;
            }
        }
        if reachable != with_free {
            return Err(IntegrityError::FreeCount {
                reachable,
                expected: with_free,
            });
        }
        Ok(())
    }

    pub(crate) fn lifecycle_logs(&self) -> impl Iterator<Item = &HeapLogRecord> {
        self.log.records()
    }

    pub(crate) fn drain_lifecycle_logs(&mut self) -> Vec<HeapLogRecord> {
        self.log.drain()
    }
}
