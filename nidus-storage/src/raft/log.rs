use nidus_common::error::{NidusError, Result};
use nidus_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// A single log entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,  // Position in the log, starting at 1
    pub term: Term,       // Term number when entry was received by leader
    pub command: Vec<u8>, // Opaque payload handed to the state machine
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            term,
            command: command.into(),
        }
    }
}

/// Ordered, gap-free sequence of entries. Entry `i` lives at `entries[i - 1]`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Rebuilds a log from persisted entries, checking they are contiguous from 1.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self> {
        for (pos, entry) in entries.iter().enumerate() {
            let expected = pos as LogIndex + 1;
            if entry.index != expected {
                return Err(NidusError::Corruption(format!(
                    "log entry at position {} has index {}, expected {}",
                    pos, entry.index, expected
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Append entries to the tail of the log. The first must follow `last_index`.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut next = self.last_index() + 1;
        for entry in entries {
            if entry.index != next {
                return Err(NidusError::Consensus(format!(
                    "non-contiguous append: got index {}, expected {}",
                    entry.index, next
                )));
            }
            next += 1;
        }
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Drops the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        let keep = index.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// Get a specific log entry by Raft log index
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `index`.
    pub fn entries_from(&self, index: LogIndex, max: usize) -> &[LogEntry] {
        let start = (index.max(1) - 1) as usize;
        if start >= self.entries.len() {
            return &[];
        }
        let end = start.saturating_add(max).min(self.entries.len());
        &self.entries[start..end]
    }

    /// Returns the last log index, or 0 if the log is empty
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// Returns the term of the last entry, or 0 if empty
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
