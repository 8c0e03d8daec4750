//! Unified log view: virtual indexing across the snapshot prefix and the
//! in-memory tail.
//!
//! All access is by logical index, counting from 1 and including the
//! snapshot-covered prefix. Entries at or below the snapshot boundary are not
//! addressable; callers that need them must ship the snapshot instead.

use crate::error::{RaftError, Result};
use crate::snapshot::SnapshotState;
use crate::state::HardState;
use crate::types::{Entry, LogIndex, Term};
use std::sync::Arc;

/// Facade over the hard state's entries and the snapshot descriptor.
#[derive(Clone)]
pub struct LogView {
    hard: Arc<HardState>,
    snapshot: Arc<SnapshotState>,
}

impl LogView {
    pub fn new(hard: Arc<HardState>, snapshot: Arc<SnapshotState>) -> Self {
        Self { hard, snapshot }
    }

    /// Index of the last entry, falling back to the snapshot boundary and
    /// finally to 0 when the node has neither.
    pub fn last_index(&self) -> LogIndex {
        match self.hard.last_entry() {
            Some(entry) => entry.index,
            None => self.snapshot.last_index(),
        }
    }

    /// Term at `last_index()`, with the same fallbacks.
    pub fn last_term(&self) -> Term {
        match self.hard.last_entry() {
            Some(entry) => entry.term,
            None => self.snapshot.last_term(),
        }
    }

    /// Entry at a logical index.
    ///
    /// Fails with `OutOfRange` when the index is covered by the snapshot
    /// (the caller must send a snapshot instead) or past the end of the log.
    pub fn entry(&self, index: LogIndex) -> Result<Entry> {
        if index == LogIndex::ZERO || index <= self.snapshot.last_index() {
            return Err(RaftError::OutOfRange { index });
        }
        self.hard
            .entry_at(index)
            .ok_or(RaftError::OutOfRange { index })
    }

    /// Term at a logical index, answering for the two virtual positions the
    /// entry accessor cannot: index 0 (term 0) and the snapshot boundary.
    pub fn term_at(&self, index: LogIndex) -> Result<Term> {
        if index == LogIndex::ZERO {
            return Ok(Term::ZERO);
        }
        if index == self.snapshot.last_index() {
            return Ok(self.snapshot.last_term());
        }
        Ok(self.entry(index)?.term)
    }

    /// Append an entry to the tail. The entry's index must be exactly
    /// `last_index() + 1`; the append persists atomically with term and vote.
    pub fn append(&self, entry: Entry) -> Result<()> {
        let expected = self.last_index().next();
        if entry.index != expected {
            return Err(RaftError::Internal {
                reason: format!(
                    "append index {} does not follow last index {}",
                    entry.index,
                    self.last_index()
                ),
            });
        }
        self.hard.append(entry)
    }

    /// Drop entries with index >= `index` (keeps `[..index-1]`).
    /// The snapshot-covered region must not be touched.
    pub fn truncate_after(&self, index: LogIndex) -> Result<()> {
        if index <= self.snapshot.last_index() {
            return Err(RaftError::OutOfRange { index });
        }
        self.hard.truncate_from(index)
    }

    /// Drop entries with index < `index` (keeps `[index..]`).
    pub fn truncate_before(&self, index: LogIndex) -> Result<()> {
        self.hard.truncate_until(index)
    }

    /// Drop the entire in-memory tail (used when an installed snapshot
    /// supersedes everything held locally).
    pub fn clear(&self) -> Result<()> {
        self.hard.clear_entries()
    }

    /// Smallest index at or below `from` whose entry still carries `term`,
    /// scanning backward. Used to build the conflict backtracking hint.
    /// Never descends into the snapshot-covered region.
    pub fn first_index_of_term(&self, from: LogIndex, term: Term) -> LogIndex {
        let floor = self.snapshot.last_index().next();
        let mut start = from;
        while start > floor {
            let below = LogIndex(start.0 - 1);
            match self.term_at(below) {
                Ok(t) if t == term => start = below,
                _ => break,
            }
        }
        start
    }
}
