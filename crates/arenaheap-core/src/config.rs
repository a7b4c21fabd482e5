//! Heap configuration.
//!
//! [`HeapConfig::default`] suits production use. [`HeapConfig::from_env`]
//! lets a deployment override it:
//! - `ARENAHEAP_FATAL`: `abort` (default) or `panic`.
//! - `ARENAHEAP_TAG`: `1`/`true`/`on`/`yes` stores the calling source line in
//!   every allocation header.
//! - `ARENAHEAP_LOG`: lifecycle log threshold, `trace`, `debug`, `info`
//!   (default), `warn`, `error` or `off`.

use crate::log::LogLevel;

/// Default number of lifecycle records kept before the oldest are dropped.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// What to do when a release proves the arena metadata is corrupt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalPolicy {
    /// Log the failure to stderr and abort the process.
    #[default]
    Abort,
    /// Panic. The heap is left untouched, so an embedder may unwind past it.
    Panic,
}

impl FatalPolicy {
    /// Parse from string (case-insensitive). Unknown input keeps the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "panic" | "unwind" => Self::Panic,
            _ => Self::Abort,
        }
    }
}

fn flag_from_str_loose(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// Per-heap configuration, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pub fatal: FatalPolicy,
    /// Record the caller's source line in each header.
    pub tag_allocations: bool,
    /// Records below this level are not kept.
    pub log_level: LogLevel,
    /// Maximum number of kept records; 0 disables lifecycle logging.
    pub log_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            fatal: FatalPolicy::Abort,
            tag_allocations: false,
            log_level: LogLevel::Info,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl HeapConfig {
    /// Read overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`HeapConfig::from_env`] with a caller-provided variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup("ARENAHEAP_FATAL") {
            config.fatal = FatalPolicy::from_str_loose(&raw);
        }
        if let Some(raw) = lookup("ARENAHEAP_TAG") {
            config.tag_allocations = flag_from_str_loose(&raw);
        }
        if let Some(raw) = lookup("ARENAHEAP_LOG") {
            if raw.trim().eq_ignore_ascii_case("off") {
                config.log_capacity = 0;
            } else if let Some(level) = LogLevel::from_str_loose(&raw) {
                config.log_level = level;
            }
        }
        config
    }

    #[must_use]
    pub const fn with_fatal(mut self, fatal: FatalPolicy) -> Self {
        self.fatal = fatal;
        self
    }

    #[must_use]
    pub const fn with_tagging(mut self, enabled: bool) -> Self {
        self.tag_allocations = enabled;
        self
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub const fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }
}
