//! Persister ports and persisted record layouts.
//!
//! Two independent ports with atomic-replace semantics: one for the hard Raft
//! state (term, vote, log) and one for the latest snapshot. Every mutation of
//! the hard state is written through its persister before it becomes visible
//! to the rest of the core.

use crate::error::{RaftError, Result};
use crate::snapshot::Snapshot;
use crate::types::{Entry, NodeId, Term};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Persisted hard-state record: `(term, voted_for, entries)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedRaftState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub entries: Vec<Entry>,
}

impl Default for PersistedRaftState {
    fn default() -> Self {
        Self {
            term: Term(1),
            voted_for: None,
            entries: Vec::new(),
        }
    }
}

/// Durable storage for the hard Raft state.
///
/// `save` must atomically replace the previous record; a crash mid-save must
/// leave either the old or the new record, never a mix.
pub trait RaftStatePersister: Send + Sync {
    fn save_raft_state(&self, state: &PersistedRaftState) -> Result<()>;

    fn load_raft_state(&self) -> Result<PersistedRaftState>;
}

/// Durable storage for the latest snapshot. Atomic replace, like the state
/// persister.
pub trait SnapshotPersister: Send + Sync {
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    fn load_snapshot(&self) -> Result<Snapshot>;
}

/// In-memory persister for tests.
///
/// Serializes records through the real bincode layout so the persisted shapes
/// stay exercised, and can be told to fail the next write to drive the fatal
/// error path.
#[derive(Default)]
pub struct InMemoryPersister {
    raft_state: Mutex<Option<Vec<u8>>>,
    snapshot: Mutex<Option<Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    fn check_writable(&self) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(RaftError::Persist {
                reason: "injected write failure".to_string(),
            });
        }
        Ok(())
    }
}

impl RaftStatePersister for InMemoryPersister {
    fn save_raft_state(&self, state: &PersistedRaftState) -> Result<()> {
        self.check_writable()?;
        let encoded = bincode::serialize(state)?;
        *self.raft_state.lock() = Some(encoded);
        Ok(())
    }

    fn load_raft_state(&self) -> Result<PersistedRaftState> {
        match self.raft_state.lock().as_deref() {
            Some(encoded) => Ok(bincode::deserialize(encoded)?),
            None => Ok(PersistedRaftState::default()),
        }
    }
}

impl SnapshotPersister for InMemoryPersister {
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.check_writable()?;
        let encoded = bincode::serialize(snapshot)?;
        *self.snapshot.lock() = Some(encoded);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Snapshot> {
        match self.snapshot.lock().as_deref() {
            Some(encoded) => Ok(bincode::deserialize(encoded)?),
            None => Ok(Snapshot::default()),
        }
    }
}
