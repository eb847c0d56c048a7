use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::bridge::lock;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LogRecord {
    pub message: String,
    pub detail: String,
    pub severity: Severity,
    pub timestamp: String,
}

impl LogRecord {
    pub fn new(severity: Severity, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: detail.into(),
            severity,
            timestamp: timestamp_now(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompilationRecord {
    /// Name of the unit that was built (a script directory for the demo host).
    pub unit: String,
    pub timestamp: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilationRecord {
    pub fn new(unit: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            unit: unit.into(),
            timestamp: timestamp_now(),
            diagnostics,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Fixed-capacity FIFO. Pushing past capacity evicts the oldest entries.
#[derive(Debug)]
pub struct BoundedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T: Clone> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        if self.items.len() > self.capacity {
            let excess = self.items.len() - self.capacity;
            for _ in 0..excess {
                self.items.pop_front();
            }
            self.dropped = self.dropped.saturating_add(excess as u64);
        }
    }

    /// Copies the newest `limit` entries (all when `None`), oldest first.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<T> {
        let skip = limit.map_or(0, |n| self.items.len().saturating_sub(n));
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<T> {
        self.items.back().cloned()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct LogSnapshot {
    pub capacity: usize,
    pub dropped: u64,
    pub entries: Vec<LogRecord>,
}

#[derive(Serialize, Clone, Debug)]
pub struct CompilationSnapshot {
    pub latest: Option<CompilationRecord>,
    pub history: Vec<CompilationRecord>,
}

/// Recent log lines and build results. Written from host callbacks, read from
/// worker threads; each buffer has its own lock and readers only get copies.
#[derive(Clone)]
pub struct EventBuffers {
    logs: Arc<Mutex<BoundedBuffer<LogRecord>>>,
    compilations: Arc<Mutex<BoundedBuffer<CompilationRecord>>>,
}

impl EventBuffers {
    pub fn new(log_capacity: usize, compilation_capacity: usize) -> Self {
        Self {
            logs: Arc::new(Mutex::new(BoundedBuffer::new(log_capacity))),
            compilations: Arc::new(Mutex::new(BoundedBuffer::new(compilation_capacity))),
        }
    }

    pub fn push_log(&self, record: LogRecord) {
        lock(&self.logs).push(record);
    }

    pub fn logs(&self, limit: Option<usize>) -> LogSnapshot {
        let logs = lock(&self.logs);
        LogSnapshot {
            capacity: logs.capacity(),
            dropped: logs.dropped(),
            entries: logs.snapshot(limit),
        }
    }

    pub fn clear_logs(&self) -> usize {
        let mut logs = lock(&self.logs);
        let cleared = logs.len();
        logs.clear();
        cleared
    }

    pub fn record_compilation(&self, record: CompilationRecord) {
        lock(&self.compilations).push(record);
    }

    pub fn compilations(&self) -> CompilationSnapshot {
        let compilations = lock(&self.compilations);
        CompilationSnapshot {
            latest: compilations.latest(),
            history: compilations.snapshot(None),
        }
    }
}
