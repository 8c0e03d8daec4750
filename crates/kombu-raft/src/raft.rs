//! The Raft node: state aggregates, role loops, and the public facade.
//!
//! One primary task owns role transitions, commit advancement, and apply.
//! It consumes a single inbound mailbox and re-enters the loop body for
//! whichever role is current. Per-follower replication workers and RPC
//! fan-out tasks run beside it and report back over channels or through the
//! thread-safe aggregate accessors; they never touch the role directly.

use crate::config::RaftConfig;
use crate::election::{send_request_votes, wait_for_majority, FinishMsg, WaitOutcome};
use crate::error::{RaftError, Result};
use crate::fsm::StateMachine;
use crate::log::LogView;
use crate::peers::PeerRegistry;
use crate::persist::{RaftStatePersister, SnapshotPersister};
use crate::replication::{fan_out, spawn_worker, FollowerRole, LeaderState, Replication};
use crate::snapshot::SnapshotState;
use crate::state::{HardState, RoleState, SoftState};
use crate::timer::TimerState;
use crate::transport::{RaftTransport, RaftRequest, RequestReceiver, RequestSender};
use crate::types::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Everything one Raft node owns. Shared behind an `Arc` between the role
/// loop, replication workers, and fan-out tasks.
pub struct RaftNode {
    pub(crate) config: RaftConfig,
    pub(crate) hard: Arc<HardState>,
    pub(crate) soft: SoftState,
    pub(crate) role: RoleState,
    pub(crate) peers: PeerRegistry,
    pub(crate) log: LogView,
    pub(crate) snapshot: Arc<SnapshotState>,
    pub(crate) leader: LeaderState,
    pub(crate) timers: TimerState,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) fsm: Mutex<Box<dyn StateMachine>>,
    pub(crate) exit: broadcast::Sender<()>,
}

impl RaftNode {
    pub fn node_id(&self) -> &NodeId {
        self.peers.me()
    }

    pub fn role(&self) -> Role {
        self.role.get()
    }

    pub fn current_term(&self) -> Term {
        self.hard.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.soft.commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.soft.last_applied()
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Current cluster configuration as this node knows it.
    pub fn peer_map(&self) -> PeerMap {
        self.peers.peers()
    }

    /// Last index folded into the local snapshot (0 when none).
    pub fn snapshot_last_index(&self) -> LogIndex {
        self.snapshot.last_index()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.peers.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.role.get() == Role::Leader && self.peers.leader_is_me()
    }

    /// Step down to follower, adopting `term` durably first.
    pub(crate) fn become_follower(&self, term: Term) -> Result<()> {
        self.hard.set_term(term)?;
        self.role.set(Role::Follower);
        tracing::info!(%term, "stepped down to follower");
        Ok(())
    }

    /// Take leadership: claim the leader slot, initialize replication
    /// progress for every peer, and assert authority with an immediate
    /// heartbeat round.
    pub(crate) fn become_leader(self: &Arc<Self>) {
        let term = self.hard.current_term();
        tracing::info!(%term, "won election, becoming leader");
        self.role.set(Role::Leader);
        self.peers.set_leader(self.peers.me().clone());

        let receivers = self.leader.install_signals();
        self.leader.stash_signal_receivers(receivers);
        for (id, addr) in self.peers.peers() {
            if self.peers.is_me(&id) {
                continue;
            }
            self.add_replication(id, addr, FollowerRole::Follower);
        }

        // Establishing heartbeat; results are irrelevant, the periodic round
        // follows within one interval.
        let peers = self.peers.peers();
        drop(fan_out(self, EntryKind::Heartbeat, &peers, true));
    }

    /// Track a follower (or learner) and spawn its replication worker.
    /// Returns the existing tracker when one is already registered.
    pub(crate) fn add_replication(
        self: &Arc<Self>,
        id: NodeId,
        addr: NodeAddr,
        role: FollowerRole,
    ) -> Arc<Replication> {
        if let Some(existing) = self.leader.replication(&id) {
            return existing;
        }
        let (repl, trigger_rx, stop_rx) =
            Replication::new(id, addr, role, self.log.last_index().next());
        self.leader.insert(repl.clone());
        spawn_worker(self.clone(), repl.clone(), trigger_rx, stop_rx);
        repl
    }

    /// Signal the outer process that this node is done (removed from the
    /// configuration or shut down).
    pub(crate) fn request_exit(&self) {
        let _ = self.exit.send(());
    }

    /// The client command path (leader only).
    pub(crate) async fn client_command(
        self: &Arc<Self>,
        request: ApplyCommandRequest,
    ) -> Result<ApplyCommandResponse> {
        self.timers.reset_heartbeat_timer();

        if !self.is_leader() {
            return Ok(ApplyCommandResponse {
                status: ApplyStatus::NotLeader,
                leader: self.peers.leader(),
            });
        }

        let entry = Entry::new(
            self.log.last_index().next(),
            self.hard.current_term(),
            EntryKind::Replicate,
            request.data,
        );
        let index = entry.index;
        self.log.append(entry)?;
        tracing::debug!(%index, "client command appended");

        let peers = self.peers.peers();
        let mut rx = fan_out(self, EntryKind::Replicate, &peers, true);
        match wait_for_majority(
            &mut rx,
            self.peers.majority(),
            peers.len(),
            self.timers.heartbeat_interval(),
            1,
        )
        .await
        {
            WaitOutcome::Majority => {}
            WaitOutcome::Short => {
                tracing::warn!(%index, "command not acknowledged by a majority in the window");
                return Err(RaftError::NoQuorum);
            }
            WaitOutcome::Degraded(term) => {
                self.become_follower(term)?;
                return Err(RaftError::NotLeader {
                    leader: self.peers.leader(),
                });
            }
        }

        self.update_leader_commit()?;
        self.check_snapshot()?;

        Ok(ApplyCommandResponse {
            status: ApplyStatus::Ok,
            leader: Some(self.peers.me().clone()),
        })
    }

    /// Advance the commit index to the largest N replicated on a majority
    /// with `log[N].term == current_term`, then apply. Committing a
    /// current-term entry commits every earlier uncommitted entry with it.
    pub(crate) fn update_leader_commit(&self) -> Result<()> {
        let current_term = self.hard.current_term();
        let last = self.log.last_index();
        let commit = self.soft.commit_index();

        let mut matches: Vec<LogIndex> = Vec::new();
        for (id, _) in self.peers.peers() {
            if self.peers.is_me(&id) {
                matches.push(last);
            } else {
                matches.push(
                    self.leader
                        .replication(&id)
                        .map(|repl| repl.match_index())
                        .unwrap_or(LogIndex::ZERO),
                );
            }
        }

        let majority = self.peers.majority();
        let mut n = last;
        while n > commit {
            let term_matches = self
                .log
                .term_at(n)
                .map(|term| term == current_term)
                .unwrap_or(false);
            if term_matches {
                let count = matches.iter().filter(|&&m| m >= n).count();
                if count >= majority {
                    self.soft.advance_commit(n);
                    tracing::debug!(commit = %n, "commit index advanced");
                    self.apply_committed()?;
                    break;
                }
            }
            n = LogIndex(n.0 - 1);
        }
        Ok(())
    }
}

/// Drive the node until shutdown: re-enter the loop body for whichever role
/// is current. Exactly one transition happens per loop exit.
pub(crate) async fn run(node: Arc<RaftNode>, mut mailbox: RequestReceiver) {
    let mut exit_rx = node.exit.subscribe();
    loop {
        let role = node.role.get();
        tracing::debug!(%role, "entering role loop");
        let should_exit = match role {
            Role::Leader => run_leader(&node, &mut mailbox, &mut exit_rx).await,
            Role::Candidate => run_candidate(&node, &mut mailbox, &mut exit_rx).await,
            Role::Follower => run_follower(&node, &mut mailbox, &mut exit_rx).await,
            Role::Learner => run_learner(&node, &mut mailbox, &mut exit_rx).await,
        };
        if should_exit {
            tracing::info!("raft node stopped");
            return;
        }
    }
}

/// Serve one inbound request in a non-leader role. Protocol RPCs go to their
/// handlers; leader-only requests are refused with the known leader.
fn serve_common(node: &Arc<RaftNode>, request: RaftRequest) {
    match request {
        RaftRequest::AppendEntries { request, reply } => {
            let _ = reply.send(node.handle_append_entries(&request));
        }
        RaftRequest::RequestVote { request, reply } => {
            let _ = reply.send(node.handle_request_vote(&request));
        }
        RaftRequest::InstallSnapshot { request, reply } => {
            let _ = reply.send(node.handle_install_snapshot(&request));
        }
        RaftRequest::ApplyCommand { reply, .. } => {
            let _ = reply.send(Ok(ApplyCommandResponse {
                status: ApplyStatus::NotLeader,
                leader: node.peers.leader(),
            }));
        }
        RaftRequest::ChangeConfig { reply, .. } => {
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: node.peers.leader(),
            }));
        }
        RaftRequest::TransferLeadership { reply, .. } => {
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: node.peers.leader(),
            }));
        }
        RaftRequest::AddNewNode { reply, .. } => {
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: node.peers.leader(),
            }));
        }
    }
}

/// Serve one inbound request as leader. Protocol traffic always flows; while
/// a transfer is active, client commands and admin requests are refused.
/// Every served request doubles as a transfer progress event.
async fn serve_leader(node: &Arc<RaftNode>, request: RaftRequest) {
    let transfer_busy = node.leader.transfer_target().is_some();
    match request {
        RaftRequest::AppendEntries { request, reply } => {
            let _ = reply.send(node.handle_append_entries(&request));
        }
        RaftRequest::RequestVote { request, reply } => {
            let _ = reply.send(node.handle_request_vote(&request));
        }
        RaftRequest::InstallSnapshot { request, reply } => {
            let _ = reply.send(node.handle_install_snapshot(&request));
        }
        RaftRequest::ApplyCommand { request, reply } => {
            if transfer_busy {
                let _ = reply.send(Err(RaftError::TransferInProgress));
            } else {
                let _ = reply.send(node.client_command(request).await);
            }
        }
        RaftRequest::ChangeConfig { request, reply } => {
            if transfer_busy {
                let _ = reply.send(Err(RaftError::TransferInProgress));
            } else {
                let _ = reply.send(node.handle_change_config(request).await);
            }
        }
        RaftRequest::TransferLeadership { request, reply } => {
            if transfer_busy {
                let _ = reply.send(Err(RaftError::TransferInProgress));
            } else {
                node.handle_transfer(request, reply).await;
            }
        }
        RaftRequest::AddNewNode { request, reply } => {
            if transfer_busy {
                let _ = reply.send(Err(RaftError::TransferInProgress));
            } else {
                let _ = reply.send(node.handle_add_new_node(request));
            }
        }
    }

    if let Some((target, _)) = node.leader.transfer_target() {
        node.check_transfer(&target).await;
    }
}

async fn run_leader(
    node: &Arc<RaftNode>,
    mailbox: &mut RequestReceiver,
    exit_rx: &mut broadcast::Receiver<()>,
) -> bool {
    node.timers.reset_heartbeat_timer();
    let mut signals = node
        .leader
        .take_signal_receivers()
        .unwrap_or_else(|| node.leader.install_signals());

    while node.role.get() == Role::Leader {
        tokio::select! {
            _ = exit_rx.recv() => {
                node.leader.teardown();
                return true;
            }
            maybe = mailbox.recv() => {
                match maybe {
                    None => {
                        node.leader.teardown();
                        return true;
                    }
                    Some(request) => serve_leader(node, request).await,
                }
            }
            _ = node.timers.tick() => {
                heartbeat_round(node).await;
                if let Some((target, _)) = node.leader.transfer_target() {
                    node.check_transfer(&target).await;
                }
            }
            Some(term) = signals.step_down.recv() => {
                tracing::info!(%term, "step-down signal from replication worker");
                let _ = node.become_follower(term);
            }
            Some(id) = signals.caught_up.recv() => {
                if let Some((target, _)) = node.leader.transfer_target() {
                    if target == id {
                        node.check_transfer(&id).await;
                    }
                }
            }
        }
    }

    node.leader.teardown();
    false
}

/// One heartbeat round: empty AppendEntries to every non-busy follower in
/// parallel, waiting at most one interval for a majority or a higher term.
async fn heartbeat_round(node: &Arc<RaftNode>) {
    node.timers.reset_heartbeat_timer();
    tracing::trace!("heartbeat tick");
    let peers = node.peers.peers();
    let mut rx = fan_out(node, EntryKind::Heartbeat, &peers, true);
    if let WaitOutcome::Degraded(term) = wait_for_majority(
        &mut rx,
        node.peers.majority(),
        peers.len(),
        node.timers.heartbeat_interval(),
        1,
    )
    .await
    {
        let _ = node.become_follower(term);
    }
}

async fn run_candidate(
    node: &Arc<RaftNode>,
    mailbox: &mut RequestReceiver,
    exit_rx: &mut broadcast::Receiver<()>,
) -> bool {
    node.timers.reset_election_timer();

    // Phase 1: pre-vote with the current term; nothing persists.
    tracing::debug!(term = %node.hard.current_term(), "starting pre-vote round");
    let mut prevote_rx = send_request_votes(node, true);
    match wait_for_majority(
        &mut prevote_rx,
        node.peers.majority(),
        node.peers.count(),
        node.timers.heartbeat_interval(),
        1,
    )
    .await
    {
        WaitOutcome::Degraded(term) => {
            let _ = node.become_follower(term);
            return false;
        }
        WaitOutcome::Short => {
            // No willing majority; sit out the (re-randomized) election
            // timeout serving protocol traffic, then start a new round.
            tracing::debug!("pre-vote round failed");
            while node.role.get() == Role::Candidate {
                tokio::select! {
                    _ = exit_rx.recv() => return true,
                    _ = node.timers.tick() => return false,
                    maybe = mailbox.recv() => {
                        match maybe {
                            None => return true,
                            Some(request) => serve_common(node, request),
                        }
                    }
                }
            }
            return false;
        }
        WaitOutcome::Majority => {}
    }

    // Phase 2: real election with a durably incremented term and self-vote.
    let term = match node.hard.term_add_and_vote(node.peers.me()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(error = %err, "could not persist election term");
            return false;
        }
    };
    tracing::info!(%term, "pre-vote passed, requesting votes");
    let mut vote_rx = send_request_votes(node, false);
    let majority = node.peers.majority();
    let mut successes = 1usize;
    let mut votes_open = true;

    if successes >= majority {
        node.become_leader();
        return false;
    }

    while node.role.get() == Role::Candidate {
        tokio::select! {
            _ = exit_rx.recv() => return true,
            _ = node.timers.tick() => {
                tracing::debug!(%term, "election timed out, starting a new round");
                return false;
            }
            maybe = mailbox.recv() => {
                match maybe {
                    None => return true,
                    Some(request) => serve_common(node, request),
                }
            }
            maybe = vote_rx.recv(), if votes_open => {
                match maybe {
                    None => votes_open = false,
                    Some(FinishMsg::Degrade(term)) => {
                        let _ = node.become_follower(term);
                        return false;
                    }
                    Some(FinishMsg::Success) => {
                        successes += 1;
                        if successes >= majority {
                            node.become_leader();
                            return false;
                        }
                    }
                    Some(_) => {}
                }
            }
        }
    }
    false
}

async fn run_follower(
    node: &Arc<RaftNode>,
    mailbox: &mut RequestReceiver,
    exit_rx: &mut broadcast::Receiver<()>,
) -> bool {
    node.timers.reset_election_timer();
    while node.role.get() == Role::Follower {
        tokio::select! {
            _ = exit_rx.recv() => return true,
            _ = node.timers.tick() => {
                tracing::info!("election timeout, becoming candidate");
                node.role.set(Role::Candidate);
                return false;
            }
            maybe = mailbox.recv() => {
                match maybe {
                    None => return true,
                    Some(request) => serve_common(node, request),
                }
            }
        }
    }
    false
}

/// Learners never time out into an election; they only absorb replication
/// traffic until a Promote entry turns them into followers.
async fn run_learner(
    node: &Arc<RaftNode>,
    mailbox: &mut RequestReceiver,
    exit_rx: &mut broadcast::Receiver<()>,
) -> bool {
    while node.role.get() == Role::Learner {
        tokio::select! {
            _ = exit_rx.recv() => return true,
            maybe = mailbox.recv() => {
                match maybe {
                    None => return true,
                    Some(request) => serve_common(node, request),
                }
            }
        }
    }
    false
}

/// A running Raft instance: owns the node and its mailbox.
pub struct Raft {
    node: Arc<RaftNode>,
    sender: RequestSender,
    mailbox: Mutex<Option<RequestReceiver>>,
}

impl Raft {
    /// Build a node from its ports. Fails on invalid configuration or when
    /// the persisted state cannot be loaded.
    pub fn new(
        me: NodeId,
        config: RaftConfig,
        peers: PeerMap,
        transport: Arc<dyn RaftTransport>,
        fsm: Box<dyn StateMachine>,
        raft_persister: Arc<dyn RaftStatePersister>,
        snapshot_persister: Arc<dyn SnapshotPersister>,
    ) -> Result<Self> {
        config.validate()?;
        if config.initial_role == Role::Follower && !peers.contains_key(&me) {
            return Err(RaftError::Config {
                reason: format!("peer map does not contain this node ({})", me),
            });
        }

        let hard = Arc::new(HardState::load(raft_persister)?);
        let snapshot = Arc::new(SnapshotState::load(
            snapshot_persister,
            config.max_log_entries,
        )?);
        let log = LogView::new(hard.clone(), snapshot.clone());
        let timers = TimerState::new(config.clone());
        let (exit, _) = broadcast::channel(8);
        let (sender, receiver) = mpsc::channel(128);

        let node = Arc::new(RaftNode {
            role: RoleState::new(config.initial_role),
            config,
            hard,
            soft: SoftState::new(),
            peers: PeerRegistry::new(peers, me),
            log,
            snapshot,
            leader: LeaderState::new(),
            timers,
            transport,
            fsm: Mutex::new(fsm),
            exit,
        });

        Ok(Self {
            node,
            sender,
            mailbox: Mutex::new(Some(receiver)),
        })
    }

    /// Spawn the role loop. Idempotent calls after the first fail.
    pub fn start(&self) -> Result<()> {
        let receiver = self.mailbox.lock().take().ok_or_else(|| RaftError::Internal {
            reason: "raft node already started".to_string(),
        })?;
        tokio::spawn(run(self.node.clone(), receiver));
        Ok(())
    }

    /// Cloneable typed handle to the inbound mailbox.
    pub fn handle(&self) -> RaftHandle {
        RaftHandle {
            sender: self.sender.clone(),
        }
    }

    /// The raw mailbox sender, for wiring this node into a transport.
    pub fn request_sender(&self) -> RequestSender {
        self.sender.clone()
    }

    /// Read access to the node (role, term, commit index, ...).
    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// Fires when the node leaves the cluster or is shut down.
    pub fn subscribe_exit(&self) -> broadcast::Receiver<()> {
        self.node.exit.subscribe()
    }

    /// Stop the role loop.
    pub fn shutdown(&self) {
        self.node.request_exit();
    }
}

/// Typed async access to a node's inbound mailbox.
#[derive(Clone)]
pub struct RaftHandle {
    sender: RequestSender,
}

macro_rules! handle_call {
    ($self:ident, $variant:ident, $request:ident) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .sender
            .send(RaftRequest::$variant {
                request: $request,
                reply,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }};
}

impl RaftHandle {
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        handle_call!(self, AppendEntries, request)
    }

    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        handle_call!(self, RequestVote, request)
    }

    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        handle_call!(self, InstallSnapshot, request)
    }

    pub async fn apply_command(
        &self,
        request: ApplyCommandRequest,
    ) -> Result<ApplyCommandResponse> {
        handle_call!(self, ApplyCommand, request)
    }

    pub async fn change_config(
        &self,
        request: ChangeConfigRequest,
    ) -> Result<ChangeConfigResponse> {
        handle_call!(self, ChangeConfig, request)
    }

    pub async fn transfer_leadership(
        &self,
        request: TransferLeadershipRequest,
    ) -> Result<TransferLeadershipResponse> {
        handle_call!(self, TransferLeadership, request)
    }

    pub async fn add_new_node(&self, request: AddNewNodeRequest) -> Result<AddNewNodeResponse> {
        handle_call!(self, AddNewNode, request)
    }
}
