//! Core Raft types: terms, log indices, entries, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Terms establish logical clocks in Raft. Each term has at most one leader.
/// When a server starts an election, it increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Logical log index (1-indexed, 0 is sentinel for "before the log").
///
/// Logical indices span the whole replicated log, including the prefix
/// already folded into a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Node identifier (unique across the cluster).
///
/// NodeId is a string to support DNS names, UUIDs, or IP:port combinations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque transport endpoint for a node.
///
/// The transport resolves this to whatever addressing it understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub String);

impl NodeAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        NodeAddr(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster membership map replicated through ChangeConf entries.
pub type PeerMap = HashMap<NodeId, NodeAddr>;

/// Kind of an AppendEntries exchange and of the entry it carries.
///
/// `Heartbeat` and `TimeoutNow` never appear in the log; they only tag RPCs.
/// `Promote` is sent to a caught-up learner and is likewise not logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A client command to be replicated and applied.
    Replicate,
    /// Empty AppendEntries keeping followers alive and shipping the commit index.
    Heartbeat,
    /// A serialized peer map for a membership change.
    ChangeConf,
    /// Orders the receiver to start an election immediately (leadership transfer).
    TimeoutNow,
    /// Upgrades a caught-up learner to follower.
    Promote,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryKind::Replicate => "Replicate",
            EntryKind::Heartbeat => "Heartbeat",
            EntryKind::ChangeConf => "ChangeConf",
            EntryKind::TimeoutNow => "TimeoutNow",
            EntryKind::Promote => "Promote",
        };
        write!(f, "{}", s)
    }
}

/// Log entry (command + metadata).
///
/// Indices are dense and strictly increasing across the snapshot prefix and
/// the in-memory tail. Two entries with equal (index, term) carry equal data
/// on every node (Log Matching).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    pub data: Bytes,
}

impl Entry {
    pub fn new(index: LogIndex, term: Term, kind: EntryKind, data: Bytes) -> Self {
        Self {
            index,
            term,
            kind,
            data,
        }
    }
}

/// Raft role (Leader, Candidate, Follower, or non-voting Learner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Candidate,
    Follower,
    Learner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "Leader"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Follower => write!(f, "Follower"),
            Role::Learner => write!(f, "Learner"),
        }
    }
}

/// AppendEntries RPC request.
///
/// Sent by the leader to replicate entries, ship heartbeats, distribute
/// configuration, trigger transfers, and promote learners, discriminated by
/// `kind`. Heartbeats carry the leader's current last index as
/// `prev_log_index` and run the same consistency check as replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// What this exchange carries.
    pub kind: EntryKind,

    /// Leader's term.
    pub term: Term,

    /// Leader's ID (so followers can redirect clients).
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,

    /// Term of the `prev_log_index` entry.
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat/timeout-now/promote).
    pub entries: Vec<Entry>,

    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
///
/// On a consistency-check failure the conflict hints let the leader skip
/// whole terms while backtracking instead of decrementing one index at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Receiver's current term, for the leader to update itself.
    pub term: Term,

    /// True if the receiver matched `prev_log_index`/`prev_log_term`.
    pub success: bool,

    /// Term of the conflicting entry (backtracking hint).
    pub conflict_term: Option<Term>,

    /// Smallest index still carrying `conflict_term` (backtracking hint).
    pub conflict_start_index: Option<LogIndex>,
}

impl AppendEntriesResponse {
    pub(crate) fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            conflict_term: None,
            conflict_start_index: None,
        }
    }

    pub(crate) fn accepted(term: Term) -> Self {
        Self {
            term,
            success: true,
            conflict_term: None,
            conflict_start_index: None,
        }
    }
}

/// RequestVote RPC request.
///
/// Serves both election phases. A pre-vote probe carries the candidate's
/// current (un-incremented) term and `pre_vote: true`; granting it is a
/// statement of willingness that binds nobody and persists nothing. The real
/// vote carries the incremented term and is subject to the one-vote-per-term
/// rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,

    /// Candidate requesting the vote.
    pub candidate_id: NodeId,

    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry.
    pub last_log_term: Term,

    /// True for the non-binding pre-vote round.
    pub pre_vote: bool,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself.
    pub term: Term,

    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// InstallSnapshot RPC request.
///
/// Sent when a follower is so far behind that the entries it needs have been
/// compacted away. Large snapshots may arrive in chunks; `offset` 0 restarts
/// assembly and `done` finalizes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,

    /// Leader's ID.
    pub leader_id: NodeId,

    /// Index of the last entry covered by the snapshot.
    pub last_included_index: LogIndex,

    /// Term of `last_included_index`.
    pub last_included_term: Term,

    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,

    /// Snapshot chunk data.
    pub data: Bytes,

    /// True if this is the last chunk.
    pub done: bool,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Receiver's current term, for the leader to update itself.
    pub term: Term,
}

/// Client command submitted for replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyCommandRequest {
    /// Opaque payload handed to the state machine once committed.
    pub data: Bytes,
}

/// Outcome of a client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyStatus {
    Ok,
    NotLeader,
}

/// Reply to a client command.
///
/// `NotLeader` carries the last known leader so clients can redirect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyCommandResponse {
    pub status: ApplyStatus,
    pub leader: Option<NodeId>,
}

/// Cluster membership change request (joint consensus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConfigRequest {
    /// The target configuration C_new.
    pub peers: PeerMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConfigResponse {
    pub success: bool,
}

/// Leadership transfer request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeadershipRequest {
    pub transferee: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeadershipResponse {
    pub success: bool,
}

/// Registers a fresh node as a learner for catch-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNewNodeRequest {
    pub id: NodeId,
    pub addr: NodeAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNewNodeResponse {
    pub success: bool,
}
