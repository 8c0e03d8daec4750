//! Snapshot state: the latest snapshot descriptor and chunk assembly.
//!
//! A snapshot stands for the logical log prefix `[1 ..= last_index]`; no entry
//! at or below `last_index` is held in memory. Snapshots are replaced
//! wholesale and never mutated in place.

use crate::error::Result;
use crate::persist::SnapshotPersister;
use crate::types::{LogIndex, Term};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Snapshot descriptor plus the serialized state-machine bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Last logical index covered by this snapshot.
    pub last_index: LogIndex,

    /// Term at `last_index`.
    pub last_term: Term,

    /// Opaque serialized state machine.
    pub data: Bytes,
}

impl Snapshot {
    pub fn new(last_index: LogIndex, last_term: Term, data: Bytes) -> Self {
        Self {
            last_index,
            last_term,
            data,
        }
    }

    /// True when no snapshot has ever been taken.
    pub fn is_empty(&self) -> bool {
        self.last_index == LogIndex::ZERO
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            last_index: LogIndex::ZERO,
            last_term: Term::ZERO,
            data: Bytes::new(),
        }
    }
}

/// Owns the latest snapshot, the compaction threshold, and in-flight chunk
/// assembly on the receiving side.
pub struct SnapshotState {
    persister: Arc<dyn SnapshotPersister>,
    inner: Mutex<Inner>,
    max_log_entries: u64,
}

struct Inner {
    current: Snapshot,
    /// Chunk assembly buffer for a snapshot arriving over InstallSnapshot.
    pending: Vec<u8>,
}

impl SnapshotState {
    /// Load the latest snapshot from the persister.
    pub fn load(persister: Arc<dyn SnapshotPersister>, max_log_entries: u64) -> Result<Self> {
        let current = persister.load_snapshot()?;
        Ok(Self {
            persister,
            inner: Mutex::new(Inner {
                current,
                pending: Vec::new(),
            }),
            max_log_entries,
        })
    }

    pub fn last_index(&self) -> LogIndex {
        self.inner.lock().current.last_index
    }

    pub fn last_term(&self) -> Term {
        self.inner.lock().current.last_term
    }

    pub fn current(&self) -> Snapshot {
        self.inner.lock().current.clone()
    }

    /// Whether the committed-but-compactable span has reached the threshold.
    pub fn should_compact(&self, commit_index: LogIndex) -> bool {
        let inner = self.inner.lock();
        commit_index
            .as_u64()
            .saturating_sub(inner.current.last_index.as_u64())
            >= self.max_log_entries
    }

    /// Persist and adopt a locally generated snapshot.
    pub fn install(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        self.persister.save_snapshot(&snapshot)?;
        inner.current = snapshot;
        Ok(())
    }

    /// Absorb one InstallSnapshot chunk.
    ///
    /// Offset 0 restarts assembly. Every chunk persists the assembled prefix
    /// (atomic replace makes intermediate saves invisible once the final one
    /// lands), so a chunked transfer ends in the same durable state as a
    /// one-shot transfer. Returns true once the snapshot is complete and
    /// adopted.
    pub fn absorb_chunk(
        &self,
        last_index: LogIndex,
        last_term: Term,
        offset: u64,
        data: &[u8],
        done: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if offset == 0 {
            inner.pending.clear();
        }
        inner.pending.extend_from_slice(data);

        let assembled = Snapshot::new(last_index, last_term, Bytes::from(inner.pending.clone()));
        self.persister.save_snapshot(&assembled)?;

        if done {
            inner.current = assembled;
            inner.pending.clear();
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::InMemoryPersister;

    fn state(threshold: u64) -> SnapshotState {
        SnapshotState::load(Arc::new(InMemoryPersister::new()), threshold).unwrap()
    }

    #[test]
    fn test_empty_snapshot_defaults() {
        let st = state(100);
        assert_eq!(st.last_index(), LogIndex::ZERO);
        assert_eq!(st.last_term(), Term::ZERO);
        assert!(st.current().is_empty());
    }

    #[test]
    fn test_should_compact_threshold() {
        let st = state(50);
        assert!(!st.should_compact(LogIndex(49)));
        assert!(st.should_compact(LogIndex(50)));

        st.install(Snapshot::new(LogIndex(50), Term(1), Bytes::new()))
            .unwrap();
        assert!(!st.should_compact(LogIndex(99)));
        assert!(st.should_compact(LogIndex(100)));
    }

    #[test]
    fn test_chunked_equals_one_shot() {
        let chunked = state(100);
        assert!(!chunked
            .absorb_chunk(LogIndex(10), Term(2), 0, b"hello ", false)
            .unwrap());
        assert!(chunked
            .absorb_chunk(LogIndex(10), Term(2), 6, b"world", true)
            .unwrap());

        let one_shot = state(100);
        assert!(one_shot
            .absorb_chunk(LogIndex(10), Term(2), 0, b"hello world", true)
            .unwrap());

        assert_eq!(chunked.current(), one_shot.current());
    }

    #[test]
    fn test_offset_zero_restarts_assembly() {
        let st = state(100);
        st.absorb_chunk(LogIndex(5), Term(1), 0, b"garbage", false)
            .unwrap();
        st.absorb_chunk(LogIndex(5), Term(1), 0, b"fresh", true)
            .unwrap();
        assert_eq!(st.current().data, Bytes::from("fresh"));
    }
}
