//! Transport abstraction for Raft RPC communication.
//!
//! Defines the `RaftTransport` trait that allows pluggable transport
//! implementations (gRPC, HTTP, in-process channels for tests). Calls are
//! addressed by `NodeAddr` and errors are uniform: the core never
//! distinguishes wire failures from peer-side failures.
//!
//! Also defines the inbound mailbox envelope: every node consumes a single
//! queue of `RaftRequest` values, each carrying a oneshot reply sender.

use crate::error::{RaftError, Result};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Transport port for outbound RPCs.
///
/// Implementations handle connection management, serialization, and network
/// failures. All three calls are request/response; a transport-level retry
/// policy is the implementation's business, not the core's.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send AppendEntries (replication, heartbeat, config, timeout-now,
    /// promote; discriminated by the request's `kind`).
    async fn append_entries(
        &self,
        addr: &NodeAddr,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Send RequestVote (pre-vote and real vote share this call).
    async fn request_vote(
        &self,
        addr: &NodeAddr,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send InstallSnapshot to a follower that is behind the compaction point.
    async fn install_snapshot(
        &self,
        addr: &NodeAddr,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// One inbound request plus its reply sink.
///
/// The outer process (or the in-memory transport in tests) enqueues these on
/// the node's mailbox; the role loop consumes them one at a time.
#[derive(Debug)]
pub enum RaftRequest {
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<Result<AppendEntriesResponse>>,
    },
    RequestVote {
        request: RequestVoteRequest,
        reply: oneshot::Sender<Result<RequestVoteResponse>>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        reply: oneshot::Sender<Result<InstallSnapshotResponse>>,
    },
    ApplyCommand {
        request: ApplyCommandRequest,
        reply: oneshot::Sender<Result<ApplyCommandResponse>>,
    },
    ChangeConfig {
        request: ChangeConfigRequest,
        reply: oneshot::Sender<Result<ChangeConfigResponse>>,
    },
    TransferLeadership {
        request: TransferLeadershipRequest,
        reply: oneshot::Sender<Result<TransferLeadershipResponse>>,
    },
    AddNewNode {
        request: AddNewNodeRequest,
        reply: oneshot::Sender<Result<AddNewNodeResponse>>,
    },
}

pub type RequestSender = mpsc::Sender<RaftRequest>;
pub type RequestReceiver = mpsc::Receiver<RaftRequest>;

/// In-memory transport for tests: routes addresses to node mailboxes over
/// local channels, no network.
///
/// Supports partition experiments by unregistering an address and re-adding
/// it later; calls to an unknown address fail like an unreachable host.
#[derive(Default)]
pub struct InMemoryTransport {
    routes: RwLock<HashMap<NodeAddr, RequestSender>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or restore) a node's mailbox under an address.
    pub fn register(&self, addr: NodeAddr, sender: RequestSender) {
        self.routes.write().insert(addr, sender);
    }

    /// Drop the route to an address (simulates a partition or a dead node).
    pub fn unregister(&self, addr: &NodeAddr) {
        self.routes.write().remove(addr);
    }

    fn route(&self, addr: &NodeAddr) -> Result<RequestSender> {
        self.routes
            .read()
            .get(addr)
            .cloned()
            .ok_or_else(|| RaftError::Rpc {
                addr: addr.clone(),
                reason: "no route to host".to_string(),
            })
    }

    async fn deliver<T>(
        &self,
        addr: &NodeAddr,
        request: RaftRequest,
        response: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        let sender = self.route(addr)?;
        sender.send(request).await.map_err(|_| RaftError::Rpc {
            addr: addr.clone(),
            reason: "mailbox closed".to_string(),
        })?;
        response.await.map_err(|_| RaftError::Rpc {
            addr: addr.clone(),
            reason: "reply dropped".to_string(),
        })?
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn append_entries(
        &self,
        addr: &NodeAddr,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (reply, rx) = oneshot::channel();
        self.deliver(addr, RaftRequest::AppendEntries { request, reply }, rx)
            .await
    }

    async fn request_vote(
        &self,
        addr: &NodeAddr,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.deliver(addr, RaftRequest::RequestVote { request, reply }, rx)
            .await
    }

    async fn install_snapshot(
        &self,
        addr: &NodeAddr,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let (reply, rx) = oneshot::channel();
        self.deliver(addr, RaftRequest::InstallSnapshot { request, reply }, rx)
            .await
    }
}
