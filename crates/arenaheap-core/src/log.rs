//! Structured heap lifecycle records.
//!
//! Each heap keeps a bounded ring of [`HeapLogRecord`]s describing its
//! decisions (initialization, allocations, releases, failures). Records
//! serialize to one JSON object per line.

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::HeapConfig;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse from string (case-insensitive). `off` and unknown input yield `None`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Structured heap lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id: `arenaheap::{variant}::{symbol}::{decision_id:016x}`.
    pub trace_id: String,
    pub level: LogLevel,
    /// `native` or `relocatable`.
    pub variant: &'static str,
    /// API entry point (`init`, `attach`, `allocate`, `release`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `alignment_search`, ...).
    pub event: &'static str,
    /// Arena-relative payload or span offset.
    pub offset: Option<usize>,
    pub size: Option<usize>,
    pub align: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: live allocations after the event.
    pub live_allocations: usize,
}

impl HeapLogRecord {
    /// Render as a single JSONL line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One event, before it is stamped with ids.
pub(crate) struct Event {
    pub level: LogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub offset: Option<usize>,
    pub size: Option<usize>,
    pub align: Option<usize>,
    pub outcome: &'static str,
    pub details: String,
}

pub(crate) struct LifecycleLog {
    variant: &'static str,
    threshold: LogLevel,
    capacity: usize,
    next_decision_id: u64,
    records: VecDeque<HeapLogRecord>,
}

impl LifecycleLog {
    pub(crate) fn new(variant: &'static str, config: &HeapConfig) -> Self {
        Self {
            variant,
            threshold: config.log_level,
            capacity: config.log_capacity,
            next_decision_id: 1,
            records: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn enabled(&self, level: LogLevel) -> bool {
        self.capacity > 0 && level >= self.threshold
    }

    pub(crate) fn record(&mut self, event: Event, live_allocations: usize) {
        if !self.enabled(event.level) {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(HeapLogRecord {
            decision_id,
            trace_id: format!(
                "arenaheap::{}::{}::{:016x}",
                self.variant, event.symbol, decision_id
            ),
            level: event.level,
            variant: self.variant,
            symbol: event.symbol,
            event: event.event,
            offset: event.offset,
            size: event.size,
            align: event.align,
            outcome: event.outcome,
            details: event.details,
            live_allocations,
        });
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &HeapLogRecord> {
        self.records.iter()
    }

    pub(crate) fn drain(&mut self) -> Vec<HeapLogRecord> {
        self.records.drain(..).collect()
    }
}
