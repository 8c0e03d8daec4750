//! Leader-side replication tracking.
//!
//! Each follower gets one long-lived worker listening on a trigger channel.
//! A trigger runs the two-phase catch-up: probe backward for the match point
//! (`find_next_index`), then stream entries forward (`complete_entries`),
//! shipping a whole snapshot when the follower is behind the compaction
//! point. The busy flag keeps heartbeats and client fan-outs away from a
//! follower that is already being caught up, so there is never more than one
//! outbound AppendEntries in flight per peer.

use crate::election::FinishMsg;
use crate::raft::RaftNode;
use crate::snapshot::Snapshot;
use crate::types::{
    AppendEntriesRequest, EntryKind, InstallSnapshotRequest, LogIndex, NodeAddr, NodeId, PeerMap,
    Term, TransferLeadershipResponse,
};
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

/// Role of a tracked follower. Learners replicate but do not vote and are
/// not part of the peer registry until promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FollowerRole {
    Follower,
    Learner,
}

/// Per-follower replication progress plus the worker's control channels.
pub(crate) struct Replication {
    pub id: NodeId,
    pub addr: NodeAddr,
    progress: Mutex<Progress>,
    trigger_tx: mpsc::Sender<()>,
    stop_tx: broadcast::Sender<()>,
}

struct Progress {
    next_index: LogIndex,
    match_index: LogIndex,
    rpc_busy: bool,
    role: FollowerRole,
}

impl Replication {
    /// Build a tracker. Returns the receivers the worker task consumes.
    pub fn new(
        id: NodeId,
        addr: NodeAddr,
        role: FollowerRole,
        next_index: LogIndex,
    ) -> (Arc<Self>, mpsc::Receiver<()>, broadcast::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = broadcast::channel(4);
        let repl = Arc::new(Self {
            id,
            addr,
            progress: Mutex::new(Progress {
                next_index,
                match_index: LogIndex::ZERO,
                rpc_busy: false,
                role,
            }),
            trigger_tx,
            stop_tx,
        });
        (repl, trigger_rx, stop_rx)
    }

    pub fn next_index(&self) -> LogIndex {
        self.progress.lock().next_index
    }

    pub fn set_next_index(&self, index: LogIndex) {
        self.progress.lock().next_index = index;
    }

    pub fn match_index(&self) -> LogIndex {
        self.progress.lock().match_index
    }

    pub fn set_match_and_next(&self, match_index: LogIndex, next_index: LogIndex) {
        let mut progress = self.progress.lock();
        progress.match_index = match_index;
        progress.next_index = next_index;
    }

    pub fn busy(&self) -> bool {
        self.progress.lock().rpc_busy
    }

    pub fn set_busy(&self, busy: bool) {
        self.progress.lock().rpc_busy = busy;
    }

    pub fn role(&self) -> FollowerRole {
        self.progress.lock().role
    }

    pub fn promote(&self) {
        self.progress.lock().role = FollowerRole::Follower;
    }

    /// Wake the worker. Coalesces: a trigger already pending is enough.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Tell the worker to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Active leadership transfer.
pub(crate) struct Transfer {
    pub transferee: NodeId,
    pub deadline: Instant,
    pub reply: oneshot::Sender<Result<TransferLeadershipResponse>>,
}

/// Receiving ends of the per-term worker→leader signal channels; consumed by
/// the leader loop.
pub(crate) struct SignalReceivers {
    pub step_down: mpsc::Receiver<Term>,
    pub caught_up: mpsc::Receiver<NodeId>,
}

/// Everything the leader tracks about its followers, plus the channels the
/// workers use to call back into the leader loop.
pub(crate) struct LeaderState {
    replications: RwLock<HashMap<NodeId, Arc<Replication>>>,
    step_down_tx: Mutex<Option<mpsc::Sender<Term>>>,
    caught_up_tx: Mutex<Option<mpsc::Sender<NodeId>>>,
    signal_rx: Mutex<Option<SignalReceivers>>,
    transfer: Mutex<Option<Transfer>>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self {
            replications: RwLock::new(HashMap::new()),
            step_down_tx: Mutex::new(None),
            caught_up_tx: Mutex::new(None),
            signal_rx: Mutex::new(None),
            transfer: Mutex::new(None),
        }
    }

    /// Create fresh per-term signal channels. Senders stay here for the
    /// workers; the receivers are returned for the leader loop. Called on
    /// becoming leader, before any worker is spawned.
    pub fn install_signals(&self) -> SignalReceivers {
        let (step_down_tx, step_down) = mpsc::channel(16);
        let (caught_up_tx, caught_up) = mpsc::channel(16);
        *self.step_down_tx.lock() = Some(step_down_tx);
        *self.caught_up_tx.lock() = Some(caught_up_tx);
        SignalReceivers {
            step_down,
            caught_up,
        }
    }

    /// Park the receivers between `become_leader` and the leader loop entry.
    pub fn stash_signal_receivers(&self, receivers: SignalReceivers) {
        *self.signal_rx.lock() = Some(receivers);
    }

    pub fn take_signal_receivers(&self) -> Option<SignalReceivers> {
        self.signal_rx.lock().take()
    }

    /// Ask the leader loop to step down to `term`.
    pub fn notify_step_down(&self, term: Term) {
        if let Some(tx) = self.step_down_tx.lock().clone() {
            let _ = tx.try_send(term);
        }
    }

    /// Report that a follower finished catching up (transfer progress event).
    pub fn notify_caught_up(&self, id: NodeId) {
        if let Some(tx) = self.caught_up_tx.lock().clone() {
            let _ = tx.try_send(id);
        }
    }

    pub fn replication(&self, id: &NodeId) -> Option<Arc<Replication>> {
        self.replications.read().get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.replications.read().contains_key(id)
    }

    pub fn insert(&self, repl: Arc<Replication>) {
        self.replications.write().insert(repl.id.clone(), repl);
    }

    /// Stop and drop workers for followers outside the new configuration.
    pub fn retain_members(&self, keep: &PeerMap) {
        let mut replications = self.replications.write();
        replications.retain(|id, repl| {
            if keep.contains_key(id) {
                true
            } else {
                tracing::debug!(follower = %id, "stopping replication for removed node");
                repl.stop();
                false
            }
        });
    }

    /// Tear down all workers and per-term channels (leadership lost).
    pub fn teardown(&self) {
        let mut replications = self.replications.write();
        for repl in replications.values() {
            repl.stop();
        }
        replications.clear();
        drop(replications);
        *self.step_down_tx.lock() = None;
        *self.caught_up_tx.lock() = None;
        *self.signal_rx.lock() = None;
        if let Some(transfer) = self.transfer.lock().take() {
            let _ = transfer
                .reply
                .send(Ok(TransferLeadershipResponse { success: false }));
        }
    }

    pub fn set_transfer(&self, transfer: Transfer) {
        *self.transfer.lock() = Some(transfer);
    }

    /// Target and deadline of the active transfer, if any.
    pub fn transfer_target(&self) -> Option<(NodeId, Instant)> {
        self.transfer
            .lock()
            .as_ref()
            .map(|t| (t.transferee.clone(), t.deadline))
    }

    pub fn take_transfer(&self) -> Option<Transfer> {
        self.transfer.lock().take()
    }
}

/// Spawn the long-lived worker for one follower.
pub(crate) fn spawn_worker(
    node: Arc<RaftNode>,
    repl: Arc<Replication>,
    mut trigger_rx: mpsc::Receiver<()>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    tracing::trace!(follower = %repl.id, "replication worker stopped");
                    return;
                }
                triggered = trigger_rx.recv() => {
                    if triggered.is_none() {
                        return;
                    }
                    catch_up(&node, &repl, &mut stop_rx).await;
                }
            }
        }
    });
}

/// One full catch-up pass, promoting a learner once it is level.
async fn catch_up(node: &Arc<RaftNode>, repl: &Arc<Replication>, stop_rx: &mut broadcast::Receiver<()>) {
    tracing::debug!(follower = %repl.id, next = %repl.next_index(), "catch-up started");
    repl.set_busy(true);
    let caught_up = replicate(node, repl, stop_rx).await;
    repl.set_busy(false);
    tracing::debug!(follower = %repl.id, success = caught_up, "catch-up finished");

    if !caught_up {
        return;
    }

    if repl.role() == FollowerRole::Learner {
        match replication_to(node, repl, EntryKind::Promote).await {
            FinishMsg::Success => {
                repl.promote();
                node.peers.add_peer(repl.id.clone(), repl.addr.clone());
                tracing::info!(follower = %repl.id, "learner promoted to follower");
            }
            FinishMsg::Degrade(term) => {
                node.leader.notify_step_down(term);
                return;
            }
            _ => return,
        }
    }

    node.leader.notify_caught_up(repl.id.clone());
}

fn stopped(stop_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

async fn replicate(
    node: &Arc<RaftNode>,
    repl: &Arc<Replication>,
    stop_rx: &mut broadcast::Receiver<()>,
) -> bool {
    find_next_index(node, repl, stop_rx).await && complete_entries(node, repl, stop_rx).await
}

/// Probe backward with empty AppendEntries until the follower accepts
/// `prev_log_index`, steering by the conflict hints.
async fn find_next_index(
    node: &Arc<RaftNode>,
    repl: &Arc<Replication>,
    stop_rx: &mut broadcast::Receiver<()>,
) -> bool {
    loop {
        let next = repl.next_index();
        if next <= LogIndex(1) {
            return true;
        }
        if stopped(stop_rx) {
            return false;
        }
        // Behind the compaction point; complete_entries ships the snapshot.
        if next <= node.snapshot.last_index() {
            return true;
        }

        let prev = LogIndex(next.0 - 1);
        let prev_term = match node.log.term_at(prev) {
            Ok(term) => term,
            Err(_) => return true,
        };
        let term = node.hard.current_term();
        let request = AppendEntriesRequest {
            kind: EntryKind::Replicate,
            term,
            leader_id: node.peers.me().clone(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries: Vec::new(),
            leader_commit: node.soft.commit_index(),
        };

        let response = match node.transport.append_entries(&repl.addr, request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(follower = %repl.id, error = %err, "probe rpc failed");
                return false;
            }
        };

        if response.term > term {
            node.leader.notify_step_down(response.term);
            return false;
        }
        if response.success {
            tracing::trace!(follower = %repl.id, %prev, "log match found");
            return true;
        }

        let mut candidate = response.conflict_start_index.unwrap_or(LogIndex::ZERO);
        if candidate == LogIndex::ZERO {
            // Follower log is empty; start from the beginning.
            candidate = LogIndex(1);
        } else if let (Ok(local_term), Some(conflict_term)) =
            (node.log.term_at(candidate), response.conflict_term)
        {
            if local_term == conflict_term {
                candidate = candidate.next();
            }
        }
        if candidate >= next {
            // Hints made no progress; fall back to a single-step decrement.
            candidate = prev.max(LogIndex(1));
        }
        tracing::trace!(follower = %repl.id, next = %candidate, "backtracking next index");
        repl.set_next_index(candidate);
    }
}

/// Walk the follower forward to the leader's last index, one entry per RPC,
/// shipping the snapshot wholesale when the follower is behind it.
async fn complete_entries(
    node: &Arc<RaftNode>,
    repl: &Arc<Replication>,
    stop_rx: &mut broadcast::Receiver<()>,
) -> bool {
    loop {
        let next = repl.next_index();
        if next.0.saturating_sub(1) >= node.log.last_index().0 {
            return true;
        }
        if stopped(stop_rx) {
            return false;
        }

        let snapshot = node.snapshot.current();
        if !snapshot.is_empty() && next <= snapshot.last_index {
            tracing::debug!(follower = %repl.id, snapshot_last = %snapshot.last_index,
                "follower behind compaction point, sending snapshot");
            match snapshot_to(node, repl, &snapshot).await {
                FinishMsg::Success => {
                    repl.set_match_and_next(snapshot.last_index, snapshot.last_index.next());
                    continue;
                }
                FinishMsg::Degrade(term) => {
                    node.leader.notify_step_down(term);
                    return false;
                }
                _ => return false,
            }
        }

        let entry = match node.log.entry(next) {
            Ok(entry) => entry,
            Err(_) => return false,
        };
        let prev = LogIndex(next.0 - 1);
        let prev_term = match node.log.term_at(prev) {
            Ok(term) => term,
            Err(_) => return false,
        };
        let term = node.hard.current_term();
        let request = AppendEntriesRequest {
            kind: EntryKind::Replicate,
            term,
            leader_id: node.peers.me().clone(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries: vec![entry],
            leader_commit: node.soft.commit_index(),
        };

        let response = match node.transport.append_entries(&repl.addr, request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(follower = %repl.id, error = %err, "replication rpc failed");
                return false;
            }
        };

        if response.term > term {
            node.leader.notify_step_down(response.term);
            return false;
        }
        if !response.success {
            // The match point moved under us; the next trigger re-probes.
            tracing::debug!(follower = %repl.id, %next, "unexpected mismatch during completion");
            return false;
        }
        repl.set_match_and_next(next, next.next());
    }
}

/// Send the current snapshot in one shot.
async fn snapshot_to(node: &Arc<RaftNode>, repl: &Arc<Replication>, snapshot: &Snapshot) -> FinishMsg {
    let term = node.hard.current_term();
    let request = InstallSnapshotRequest {
        term,
        leader_id: node.peers.me().clone(),
        last_included_index: snapshot.last_index,
        last_included_term: snapshot.last_term,
        offset: 0,
        data: snapshot.data.clone(),
        done: true,
    };
    match node.transport.install_snapshot(&repl.addr, request).await {
        Err(err) => {
            tracing::debug!(follower = %repl.id, error = %err, "snapshot rpc failed");
            FinishMsg::RpcFailed
        }
        Ok(response) if response.term > term => FinishMsg::Degrade(response.term),
        Ok(_) => FinishMsg::Success,
    }
}

/// Send one AppendEntries of the given kind to a single follower.
///
/// Heartbeat, Promote, and TimeoutNow travel empty with the leader's last
/// index as the consistency point; Replicate and ChangeConf carry the most
/// recently appended entry. A plain rejection from a lagging follower
/// triggers its catch-up worker (the trigger is not a success).
pub(crate) async fn replication_to(
    node: &Arc<RaftNode>,
    repl: &Arc<Replication>,
    kind: EntryKind,
) -> FinishMsg {
    let (prev_index, entries) = match kind {
        EntryKind::Heartbeat | EntryKind::Promote | EntryKind::TimeoutNow => {
            (node.log.last_index(), Vec::new())
        }
        EntryKind::Replicate | EntryKind::ChangeConf => {
            let last = node.log.last_index();
            match node.log.entry(last) {
                Ok(entry) => (LogIndex(last.0 - 1), vec![entry]),
                Err(err) => {
                    tracing::error!(follower = %repl.id, error = %err, "no entry to replicate");
                    return FinishMsg::Error;
                }
            }
        }
    };
    let prev_term = match node.log.term_at(prev_index) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(follower = %repl.id, error = %err, "previous term unavailable");
            return FinishMsg::Error;
        }
    };

    // Acceptance confirms the follower's log through here.
    let confirmed = entries.last().map(|e| e.index).unwrap_or(prev_index);

    let term = node.hard.current_term();
    let request = AppendEntriesRequest {
        kind,
        term,
        leader_id: node.peers.me().clone(),
        prev_log_index: prev_index,
        prev_log_term: prev_term,
        entries,
        leader_commit: node.soft.commit_index(),
    };

    tracing::trace!(follower = %repl.id, %kind, prev = %prev_index, "sending append entries");
    match node.transport.append_entries(&repl.addr, request).await {
        Err(err) => {
            tracing::debug!(follower = %repl.id, error = %err, "append entries rpc failed");
            FinishMsg::RpcFailed
        }
        Ok(response) if response.success => {
            if matches!(kind, EntryKind::Heartbeat | EntryKind::Replicate | EntryKind::ChangeConf)
                && confirmed > repl.match_index()
            {
                repl.set_match_and_next(confirmed, confirmed.next());
            }
            FinishMsg::Success
        }
        Ok(response) if response.term > term => FinishMsg::Degrade(response.term),
        Ok(_) => {
            if !matches!(kind, EntryKind::ChangeConf | EntryKind::TimeoutNow) {
                tracing::debug!(follower = %repl.id, "log mismatch, triggering catch-up");
                repl.trigger();
            }
            FinishMsg::Rejected
        }
    }
}

/// Fan one AppendEntries of `kind` out to every live target, returning the
/// result channel. Busy followers are skipped when `skip_busy` is set; the
/// initiator abandons stragglers by dropping the receiver.
pub(crate) fn fan_out(
    node: &Arc<RaftNode>,
    kind: EntryKind,
    targets: &PeerMap,
    skip_busy: bool,
) -> mpsc::Receiver<FinishMsg> {
    let (finish_tx, finish_rx) = mpsc::channel(targets.len().max(1));
    for id in targets.keys() {
        if node.peers.is_me(id) {
            continue;
        }
        let Some(repl) = node.leader.replication(id) else {
            continue;
        };
        if skip_busy && repl.busy() {
            tracing::trace!(follower = %id, "skipping busy follower");
            continue;
        }
        let node = node.clone();
        let finish_tx = finish_tx.clone();
        tokio::spawn(async move {
            let msg = replication_to(&node, &repl, kind).await;
            let _ = finish_tx.send(msg).await;
        });
    }
    finish_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_accessors() {
        let (repl, _trigger, _stop) = Replication::new(
            NodeId::new("n2"),
            NodeAddr::new("a2"),
            FollowerRole::Follower,
            LogIndex(5),
        );
        assert_eq!(repl.next_index(), LogIndex(5));
        assert_eq!(repl.match_index(), LogIndex::ZERO);
        assert!(!repl.busy());

        repl.set_match_and_next(LogIndex(5), LogIndex(6));
        assert_eq!(repl.match_index(), LogIndex(5));
        assert_eq!(repl.next_index(), LogIndex(6));
    }

    #[test]
    fn test_learner_promotion() {
        let (repl, _trigger, _stop) = Replication::new(
            NodeId::new("n4"),
            NodeAddr::new("a4"),
            FollowerRole::Learner,
            LogIndex(1),
        );
        assert_eq!(repl.role(), FollowerRole::Learner);
        repl.promote();
        assert_eq!(repl.role(), FollowerRole::Follower);
    }

    #[test]
    fn test_trigger_coalesces() {
        let (repl, mut trigger_rx, _stop) = Replication::new(
            NodeId::new("n2"),
            NodeAddr::new("a2"),
            FollowerRole::Follower,
            LogIndex(1),
        );
        repl.trigger();
        repl.trigger();
        repl.trigger();
        assert!(trigger_rx.try_recv().is_ok());
        assert!(trigger_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retain_members_stops_removed() {
        let leader = LeaderState::new();
        let (kept, _t1, _s1) = Replication::new(
            NodeId::new("n2"),
            NodeAddr::new("a2"),
            FollowerRole::Follower,
            LogIndex(1),
        );
        let (removed, _t2, mut removed_stop) = Replication::new(
            NodeId::new("n3"),
            NodeAddr::new("a3"),
            FollowerRole::Follower,
            LogIndex(1),
        );
        leader.insert(kept);
        leader.insert(removed);

        let mut keep = PeerMap::new();
        keep.insert(NodeId::new("n2"), NodeAddr::new("a2"));
        leader.retain_members(&keep);

        assert!(leader.contains(&NodeId::new("n2")));
        assert!(!leader.contains(&NodeId::new("n3")));
        assert!(removed_stop.try_recv().is_ok());
    }
}
