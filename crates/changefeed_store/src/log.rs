//! Per-range change log in latest-version mode.

use serde_json::Value;

/// Kind of write that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// The document did not exist before.
    Create,
    /// The document replaced an earlier version.
    Replace,
}

impl OperationKind {
    /// Returns the wire name (`create` / `replace`).
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Replace => "replace",
        }
    }
}

/// One retained change.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Log sequence number within the range.
    pub lsn: u64,
    /// Conflict-resolution timestamp.
    pub crts: u64,
    /// Operation kind.
    pub operation: OperationKind,
    /// Document id.
    pub id: String,
    /// Document with system properties.
    pub document: Value,
}

/// Where a read after a given position lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
    /// Read entries with an LSN above this one.
    After(u64),
    /// The position was truncated away.
    Gone,
    /// The position lies beyond the end of the log.
    Ahead,
}

/// Change log of one partition range.
///
/// The log maintains:
/// - Only the latest version of each document, in LSN order
/// - The next LSN to assign (starts at 1)
/// - A truncation floor: positions below it can no longer be resumed from
#[derive(Debug)]
pub struct PartitionLog {
    entries: Vec<LogEntry>,
    next_lsn: u64,
    floor: u64,
}

impl PartitionLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_lsn: 1,
            floor: 1,
        }
    }

    /// Returns the next LSN to be assigned.
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Returns the lowest LSN still resumable from.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Returns the number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if a document with this id has a retained entry.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Returns the latest version of a document.
    pub fn get(&self, id: &str) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Appends a new version, dropping the previous one.
    ///
    /// `stamp` receives the assigned LSN and returns the stored document.
    pub fn append(
        &mut self,
        id: String,
        operation: OperationKind,
        crts: u64,
        stamp: impl FnOnce(u64) -> Value,
    ) -> &LogEntry {
        self.entries.retain(|entry| entry.id != id);
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        self.entries.push(LogEntry {
            lsn,
            crts,
            operation,
            id,
            document: stamp(lsn),
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Resolves a resume position. `None` is the beginning of the log.
    ///
    /// Resuming after `lsn` is valid while nothing after it was truncated.
    pub fn position(&self, after: Option<u64>) -> ReadPosition {
        match after {
            None => ReadPosition::After(self.floor - 1),
            Some(lsn) if lsn >= self.next_lsn => ReadPosition::Ahead,
            Some(lsn) if lsn + 1 < self.floor => ReadPosition::Gone,
            Some(lsn) => ReadPosition::After(lsn),
        }
    }

    /// Returns up to `limit` entries with an LSN above `after`.
    pub fn entries_after(&self, after: u64, limit: usize) -> &[LogEntry] {
        let start = self.entries.partition_point(|entry| entry.lsn <= after);
        let end = start.saturating_add(limit).min(self.entries.len());
        &self.entries[start..end]
    }

    /// Drops every entry below `lsn`. Positions before it become gone.
    ///
    /// Returns the number of dropped entries.
    pub fn truncate_before(&mut self, lsn: u64) -> usize {
        let lsn = lsn.min(self.next_lsn);
        if lsn <= self.floor {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|entry| entry.lsn >= lsn);
        self.floor = lsn;
        before - self.entries.len()
    }
}

impl Default for PartitionLog {
    fn default() -> Self {
        Self::new()
    }
}
