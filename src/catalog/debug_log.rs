//! Capped in-memory discovery debug log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

/// One debug log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugLogEntry {
    /// When the line was recorded.
    pub at: SystemTime,
    /// Message text.
    pub message: String,
}

/// Ring buffer that only records while enabled.
#[derive(Debug)]
pub struct DebugLog {
    enabled: bool,
    capacity: usize,
    entries: VecDeque<DebugLogEntry>,
}

impl DebugLog {
    /// Create a disabled log keeping at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            enabled: false,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Whether lines are being recorded.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Toggle recording. Disabling drops every retained entry.
    ///
    /// Returns whether the setting changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }
        self.enabled = enabled;
        if !enabled {
            self.entries.clear();
        }
        true
    }

    /// Record a line if enabled, trimming to capacity.
    pub fn record(&mut self, message: impl Into<String>) {
        if !self.enabled {
            return;
        }
        self.entries.push_back(DebugLogEntry {
            at: SystemTime::now(),
            message: message.into(),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Drop all entries without changing the toggle.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Immutable copy of the retained entries, oldest first.
    pub fn snapshot(&self) -> Arc<[DebugLogEntry]> {
        self.entries.iter().cloned().collect()
    }
}
