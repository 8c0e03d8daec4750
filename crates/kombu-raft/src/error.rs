//! Raft error types.

use thiserror::Error;

use crate::types::{LogIndex, NodeAddr, NodeId};

/// Raft errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot handle write/admin requests).
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// A leadership transfer is in flight; new commands and config changes are refused.
    #[error("leadership transfer in progress")]
    TransferInProgress,

    /// The request was not acknowledged by a majority within the window.
    /// The command may still commit later; callers must be idempotent.
    #[error("request was not replicated to a majority")]
    NoQuorum,

    /// Logical index is covered by the snapshot or past the end of the log.
    #[error("log index {index} is out of range")]
    OutOfRange { index: LogIndex },

    /// Invalid configuration (rejected at construction).
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// Durable write failed; no in-memory state was mutated.
    #[error("persistence failed: {reason}")]
    Persist { reason: String },

    /// Serialization of a persisted record or a wire payload failed.
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// Outbound RPC failed. Wire errors and peer-side failures look the same.
    #[error("rpc to {addr} failed: {reason}")]
    Rpc { addr: NodeAddr, reason: String },

    /// The user state machine rejected a committed command.
    #[error("state machine apply failed: {reason}")]
    StateMachine { reason: String },

    /// The node is shutting down or has left the cluster.
    #[error("raft node is shutting down")]
    Shutdown,

    /// Internal error (bug).
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;
