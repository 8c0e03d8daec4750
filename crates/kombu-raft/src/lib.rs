//! kombu-raft: a Raft consensus engine.
//!
//! A replicated-log state machine maintaining a linearizable, fault-tolerant
//! sequence of client commands across a set of peers:
//! - Leader election with a pre-vote round and randomized timeouts
//! - Log replication with fast conflict backtracking
//! - Snapshot-based log compaction with virtual log indexing
//! - Joint consensus for safe membership changes
//! - Leadership transfer via TimeoutNow
//! - Non-voting learners for bootstrap catch-up
//!
//! Transport, durable storage, and the application state machine are ports
//! supplied at construction; the engine consumes one inbound request queue
//! and runs a single role-loop task plus per-follower replication workers.
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014) with extensions.

pub mod config;
pub mod error;
pub mod fsm;
pub mod log;
pub mod peers;
pub mod persist;
pub mod raft;
pub mod snapshot;
pub mod state;
pub mod timer;
pub mod transport;
pub mod types;

mod election;
mod handlers;
mod membership;
mod replication;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use fsm::StateMachine;
pub use persist::{PersistedRaftState, RaftStatePersister, SnapshotPersister};
pub use raft::{Raft, RaftHandle, RaftNode};
pub use snapshot::Snapshot;
pub use transport::{InMemoryTransport, RaftRequest, RaftTransport, RequestSender};
pub use types::*;
