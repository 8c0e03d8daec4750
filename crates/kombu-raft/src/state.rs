//! Node state aggregates.
//!
//! - `HardState`: term, vote, and log entries. Every mutation is written
//!   through the persister *before* the in-memory copy changes, so nothing
//!   unpersisted is ever observable.
//! - `SoftState`: commit index and last-applied index; both only move forward.
//! - `RoleState`: the current role; written only by the role loop.

use crate::error::{RaftError, Result};
use crate::persist::{PersistedRaftState, RaftStatePersister};
use crate::types::{Entry, LogIndex, NodeId, Role, Term};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Persistent state: term, vote, and the in-memory log tail.
///
/// The mutex is held across the persister write on purpose: the durable
/// record and the in-memory copy must change together or not at all.
pub struct HardState {
    inner: Mutex<HardStateInner>,
    persister: Arc<dyn RaftStatePersister>,
}

struct HardStateInner {
    term: Term,
    voted_for: Option<NodeId>,
    entries: Vec<Entry>,
}

impl HardStateInner {
    fn persisted(&self, term: Term, voted_for: Option<NodeId>, entries: &[Entry]) -> PersistedRaftState {
        PersistedRaftState {
            term,
            voted_for,
            entries: entries.to_vec(),
        }
    }
}

impl HardState {
    /// Load the hard state from the persister.
    pub fn load(persister: Arc<dyn RaftStatePersister>) -> Result<Self> {
        let state = persister.load_raft_state()?;
        Ok(Self {
            inner: Mutex::new(HardStateInner {
                term: state.term,
                voted_for: state.voted_for,
                entries: state.entries,
            }),
            persister,
        })
    }

    pub fn current_term(&self) -> Term {
        self.inner.lock().term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.inner.lock().voted_for.clone()
    }

    /// Adopt a higher term, clearing the vote. A term at or below the current
    /// one is a no-op (terms never move backward).
    pub fn set_term(&self, term: Term) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.term >= term {
            return Ok(());
        }
        let record = inner.persisted(term, None, &inner.entries);
        self.persister.save_raft_state(&record)?;
        inner.term = term;
        inner.voted_for = None;
        Ok(())
    }

    /// Increment the term and vote for `candidate` in one durable write.
    /// Used when a pre-vote round has passed and the real election starts.
    pub fn term_add_and_vote(&self, candidate: &NodeId) -> Result<Term> {
        let mut inner = self.inner.lock();
        let new_term = inner.term.next();
        let record = inner.persisted(new_term, Some(candidate.clone()), &inner.entries);
        self.persister.save_raft_state(&record)?;
        inner.term = new_term;
        inner.voted_for = Some(candidate.clone());
        Ok(new_term)
    }

    /// Record a vote for `candidate` in the current term.
    pub fn record_vote(&self, candidate: &NodeId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.voted_for.as_ref() == Some(candidate) {
            return Ok(());
        }
        let record = inner.persisted(inner.term, Some(candidate.clone()), &inner.entries);
        self.persister.save_raft_state(&record)?;
        inner.voted_for = Some(candidate.clone());
        Ok(())
    }

    /// Append one entry. The caller is responsible for index assignment; the
    /// entry must extend the tail densely.
    pub fn append(&self, entry: Entry) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(last) = inner.entries.last() {
            if entry.index != last.index.next() {
                return Err(RaftError::Internal {
                    reason: format!(
                        "append of {} does not extend last entry {}",
                        entry.index, last.index
                    ),
                });
            }
        }
        let mut entries = inner.entries.clone();
        entries.push(entry.clone());
        let record = inner.persisted(inner.term, inner.voted_for.clone(), &entries);
        self.persister.save_raft_state(&record)?;
        inner.entries = entries;
        Ok(())
    }

    /// First logical index held in memory, if any.
    pub fn first_index(&self) -> Option<LogIndex> {
        self.inner.lock().entries.first().map(|e| e.index)
    }

    pub fn last_entry(&self) -> Option<Entry> {
        self.inner.lock().entries.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry at a logical index, if held in memory.
    pub fn entry_at(&self, index: LogIndex) -> Option<Entry> {
        let inner = self.inner.lock();
        let first = inner.entries.first()?.index;
        if index < first {
            return None;
        }
        inner.entries.get((index.0 - first.0) as usize).cloned()
    }

    /// Drop entries with logical index >= `index` (conflict truncation).
    pub fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(first) = inner.entries.first().map(|e| e.index) else {
            return Ok(());
        };
        let keep = if index <= first {
            0
        } else {
            ((index.0 - first.0) as usize).min(inner.entries.len())
        };
        if keep == inner.entries.len() {
            return Ok(());
        }
        let entries: Vec<Entry> = inner.entries[..keep].to_vec();
        let record = inner.persisted(inner.term, inner.voted_for.clone(), &entries);
        self.persister.save_raft_state(&record)?;
        inner.entries = entries;
        Ok(())
    }

    /// Drop entries with logical index < `index` (compaction truncation).
    pub fn truncate_until(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(first) = inner.entries.first().map(|e| e.index) else {
            return Ok(());
        };
        if index <= first {
            return Ok(());
        }
        let drop = ((index.0 - first.0) as usize).min(inner.entries.len());
        let entries: Vec<Entry> = inner.entries[drop..].to_vec();
        let record = inner.persisted(inner.term, inner.voted_for.clone(), &entries);
        self.persister.save_raft_state(&record)?;
        inner.entries = entries;
        Ok(())
    }

    /// Drop the whole in-memory log (snapshot replaced it wholesale).
    pub fn clear_entries(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            return Ok(());
        }
        let record = inner.persisted(inner.term, inner.voted_for.clone(), &[]);
        self.persister.save_raft_state(&record)?;
        inner.entries.clear();
        Ok(())
    }
}

/// Volatile per-node state: commit index and last-applied index.
pub struct SoftState {
    inner: Mutex<SoftStateInner>,
}

struct SoftStateInner {
    commit_index: LogIndex,
    last_applied: LogIndex,
}

impl SoftState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SoftStateInner {
                commit_index: LogIndex::ZERO,
                last_applied: LogIndex::ZERO,
            }),
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.lock().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.inner.lock().last_applied
    }

    /// Advance the commit index. Backward moves are ignored (monotonic).
    pub fn advance_commit(&self, index: LogIndex) -> bool {
        let mut inner = self.inner.lock();
        if index > inner.commit_index {
            inner.commit_index = index;
            true
        } else {
            false
        }
    }

    /// Mark `index` applied. Must be exactly the successor of the previous
    /// last-applied index (apply is ordered and at-most-once).
    pub fn mark_applied(&self, index: LogIndex) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(index, inner.last_applied.next());
        inner.last_applied = index;
    }

    /// After installing a snapshot: both indices jump to at least the
    /// snapshot boundary (the snapshot *is* applied state).
    pub fn install_floor(&self, index: LogIndex) {
        let mut inner = self.inner.lock();
        if index > inner.commit_index {
            inner.commit_index = index;
        }
        if index > inner.last_applied {
            inner.last_applied = index;
        }
    }
}

impl Default for SoftState {
    fn default() -> Self {
        Self::new()
    }
}

/// Current role, written only by the role loop.
pub struct RoleState {
    role: RwLock<Role>,
}

impl RoleState {
    pub fn new(initial: Role) -> Self {
        Self {
            role: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> Role {
        *self.role.read()
    }

    pub fn set(&self, role: Role) {
        *self.role.write() = role;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::InMemoryPersister;
    use crate::types::EntryKind;
    use bytes::Bytes;

    fn hard_state() -> (HardState, Arc<InMemoryPersister>) {
        let persister = Arc::new(InMemoryPersister::new());
        let state = HardState::load(persister.clone()).unwrap();
        (state, persister)
    }

    fn entry(index: u64, term: u64) -> Entry {
        Entry::new(
            LogIndex(index),
            Term(term),
            EntryKind::Replicate,
            Bytes::from(format!("cmd{}", index)),
        )
    }

    #[test]
    fn test_initial_term_is_one() {
        let (state, _) = hard_state();
        assert_eq!(state.current_term(), Term(1));
        assert_eq!(state.voted_for(), None);
    }

    #[test]
    fn test_set_term_never_regresses() {
        let (state, _) = hard_state();
        state.set_term(Term(5)).unwrap();
        assert_eq!(state.current_term(), Term(5));
        state.set_term(Term(3)).unwrap();
        assert_eq!(state.current_term(), Term(5));
    }

    #[test]
    fn test_set_term_clears_vote() {
        let (state, _) = hard_state();
        state.record_vote(&NodeId::new("n2")).unwrap();
        state.set_term(Term(9)).unwrap();
        assert_eq!(state.voted_for(), None);
    }

    #[test]
    fn test_term_add_and_vote() {
        let (state, _) = hard_state();
        let term = state.term_add_and_vote(&NodeId::new("me")).unwrap();
        assert_eq!(term, Term(2));
        assert_eq!(state.voted_for(), Some(NodeId::new("me")));
    }

    #[test]
    fn test_persist_happens_before_visibility() {
        let (state, persister) = hard_state();
        persister.set_fail_writes(true);

        assert!(state.set_term(Term(4)).is_err());
        assert_eq!(state.current_term(), Term(1));

        assert!(state.append(entry(1, 1)).is_err());
        assert!(state.is_empty());

        persister.set_fail_writes(false);
        state.append(entry(1, 1)).unwrap();
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_append_rejects_gap() {
        let (state, _) = hard_state();
        state.append(entry(1, 1)).unwrap();
        assert!(state.append(entry(3, 1)).is_err());
    }

    #[test]
    fn test_truncate_from_and_until() {
        let (state, _) = hard_state();
        for i in 1..=5 {
            state.append(entry(i, 1)).unwrap();
        }

        state.truncate_from(LogIndex(4)).unwrap();
        assert_eq!(state.last_entry().unwrap().index, LogIndex(3));

        state.truncate_until(LogIndex(3)).unwrap();
        assert_eq!(state.first_index(), Some(LogIndex(3)));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_reload_after_restart() {
        let persister = Arc::new(InMemoryPersister::new());
        {
            let state = HardState::load(persister.clone()).unwrap();
            state.set_term(Term(3)).unwrap();
            state.record_vote(&NodeId::new("n2")).unwrap();
            state.append(entry(1, 3)).unwrap();
        }
        let reloaded = HardState::load(persister).unwrap();
        assert_eq!(reloaded.current_term(), Term(3));
        assert_eq!(reloaded.voted_for(), Some(NodeId::new("n2")));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_soft_state_monotonic_commit() {
        let soft = SoftState::new();
        assert!(soft.advance_commit(LogIndex(5)));
        assert!(!soft.advance_commit(LogIndex(3)));
        assert_eq!(soft.commit_index(), LogIndex(5));
    }

    #[test]
    fn test_soft_state_install_floor() {
        let soft = SoftState::new();
        soft.advance_commit(LogIndex(2));
        soft.install_floor(LogIndex(10));
        assert_eq!(soft.commit_index(), LogIndex(10));
        assert_eq!(soft.last_applied(), LogIndex(10));

        soft.install_floor(LogIndex(4));
        assert_eq!(soft.commit_index(), LogIndex(10));
    }
}
