//! # log
//!
//! why: manage the replicated log of commands, including the compacted prefix
//! relations: used by node.rs for replication, persisted inside PersistentState
//! what: LogEntry struct, RaftLog (entries with a snapshot offset), term lookups

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// The log as a vector with an offset.
///
/// Everything at or before `snapshot_index` has been replaced by a snapshot;
/// `snapshot_index` itself acts as the sentinel entry (index 0 / term 0 for a
/// log that was never compacted). `entries[0]` always has index
/// `snapshot_index + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLog {
    snapshot_index: u64,
    snapshot_term: u64,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry covered by the snapshot (0 if none)
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    /// Term of the last entry covered by the snapshot (0 if none)
    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    /// First index still held as an entry
    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Number of retained (uncompacted) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`.
    ///
    /// The snapshot boundary answers with the snapshot term. Returns `None`
    /// for indices compacted away or past the end.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// All entries from `index` to the end (empty if `index` is past the end)
    pub fn entries_from(&self, index: u64) -> &[LogEntry] {
        let start = index.max(self.first_index());
        if start > self.last_index() {
            return &[];
        }
        &self.entries[(start - self.first_index()) as usize..]
    }

    /// Append a new command at the next index, returning that index
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry::new(term, index, command));
        index
    }

    /// Push an entry that must land exactly at the next index
    pub fn push(&mut self, entry: LogEntry) {
        assert_eq!(
            entry.index,
            self.last_index() + 1,
            "log entries must be contiguous"
        );
        self.entries.push(entry);
    }

    /// Drop every entry at or after `index`
    pub fn truncate_from(&mut self, index: u64) {
        assert!(
            index > self.snapshot_index,
            "cannot truncate into the snapshot (index {}, snapshot {})",
            index,
            self.snapshot_index
        );
        let keep = (index - self.first_index()) as usize;
        self.entries.truncate(keep);
    }

    /// First index in the retained log whose entry has `term`, searching
    /// backwards from `from`
    pub fn first_index_of_term(&self, term: u64, from: u64) -> u64 {
        let mut index = from.min(self.last_index());
        while index > self.first_index() && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Last index holding an entry of `term`, if any
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Replace the prefix up to and including `index` with a snapshot boundary.
    ///
    /// If the log holds an entry at `index` with `term`, the suffix after it
    /// is kept; otherwise the whole log is discarded.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        if self.term_at(index) == Some(term) {
            let drop = (index - self.first_index() + 1) as usize;
            self.entries.drain(..drop);
        } else {
            self.entries.clear();
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(*term, vec![i as u8]);
        }
        log
    }

    #[test]
    fn empty_log_has_sentinel() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn compaction_keeps_matching_suffix() {
        let mut log = log_with_terms(&[1, 1, 2, 2, 3]);
        log.compact_to(3, 2);

        assert_eq!(log.snapshot_index(), 3);
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(2), None);
        assert_eq!(log.entry(4).map(|e| e.index), Some(4));
    }

    #[test]
    fn compaction_with_unknown_term_discards_everything() {
        let mut log = log_with_terms(&[1, 1, 2]);
        log.compact_to(2, 7);

        assert!(log.is_empty());
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 7);
    }

    #[test]
    fn compaction_past_end_moves_boundary() {
        let mut log = log_with_terms(&[1, 1]);
        log.compact_to(10, 4);

        assert_eq!(log.last_index(), 10);
        assert_eq!(log.append(5, vec![]), 11);
    }

    #[test]
    fn term_search_helpers() {
        let log = log_with_terms(&[1, 2, 2, 2, 3]);
        assert_eq!(log.first_index_of_term(2, 4), 2);
        assert_eq!(log.last_index_of_term(2), Some(4));
        assert_eq!(log.last_index_of_term(9), None);
    }

    #[test]
    fn entries_from_respects_offset() {
        let mut log = log_with_terms(&[1, 1, 1, 1]);
        log.compact_to(2, 1);

        assert_eq!(log.entries_from(1).len(), 2);
        assert_eq!(log.entries_from(4).len(), 1);
        assert!(log.entries_from(5).is_empty());
    }
}
