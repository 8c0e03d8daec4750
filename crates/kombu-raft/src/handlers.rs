//! Inbound protocol handlers: AppendEntries, RequestVote, InstallSnapshot.
//!
//! These run on the role-loop task for whatever role is active. They mutate
//! state only through the guarded aggregates, and every durable mutation
//! happens before the reply carrying its effects is sent.

use crate::error::{RaftError, Result};
use crate::raft::RaftNode;
use crate::snapshot::Snapshot;
use crate::types::*;

impl RaftNode {
    /// Handle AppendEntries: replication, heartbeat, configuration,
    /// timeout-now, and learner promotion, discriminated by `kind`.
    pub fn handle_append_entries(
        &self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let current = self.hard.current_term();
        if request.term < current {
            tracing::debug!(term = %current, request_term = %request.term,
                "rejecting append entries from stale leader");
            return Ok(AppendEntriesResponse::rejected(current));
        }

        // Valid leader contact from here on.
        self.timers.reset_election_timer();
        self.peers.set_leader(request.leader_id.clone());

        if request.term > current {
            self.hard.set_term(request.term)?;
        }
        match self.role.get() {
            // Another established leader in this term or later; yield.
            Role::Leader if request.term > current => self.role.set(Role::Follower),
            Role::Candidate => self.role.set(Role::Follower),
            _ => {}
        }
        let current = self.hard.current_term();

        // Consistency check with fast backtrack.
        let prev = request.prev_log_index;
        let last = self.log.last_index();
        if prev > last {
            tracing::debug!(%prev, %last, "missing prev entry, returning backtrack hint");
            return Ok(AppendEntriesResponse {
                term: current,
                success: false,
                conflict_term: Some(self.log.last_term()),
                conflict_start_index: Some(last),
            });
        }
        if prev > self.snapshot.last_index() && prev > LogIndex::ZERO {
            let local_term = self.log.term_at(prev)?;
            if local_term != request.prev_log_term {
                let start = self.log.first_index_of_term(prev, local_term);
                tracing::debug!(%prev, %local_term, conflict_start = %start,
                    "prev term mismatch, returning backtrack hint");
                return Ok(AppendEntriesResponse {
                    term: current,
                    success: false,
                    conflict_term: Some(local_term),
                    conflict_start_index: Some(start),
                });
            }
        }
        // prev at or below the snapshot boundary is committed state: a match.

        match request.kind {
            EntryKind::Replicate => self.accept_entries(request, current),
            EntryKind::Heartbeat => self.accept_heartbeat(request, current),
            EntryKind::ChangeConf => self.accept_config(request, current),
            EntryKind::TimeoutNow => self.accept_timeout_now(current),
            EntryKind::Promote => self.accept_promote(request, current),
        }
    }

    /// Store replicated entries, truncating a conflicting suffix first.
    /// Commit never advances here; the next heartbeat carries it.
    fn accept_entries(
        &self,
        request: &AppendEntriesRequest,
        current: Term,
    ) -> Result<AppendEntriesResponse> {
        for entry in &request.entries {
            if self.log.last_index() >= entry.index {
                match self.log.entry(entry.index) {
                    Ok(local) if local.term == entry.term => {
                        tracing::trace!(index = %entry.index, "entry already present");
                        continue;
                    }
                    Ok(local) => {
                        tracing::debug!(index = %entry.index, local_term = %local.term,
                            entry_term = %entry.term, "conflicting suffix, truncating");
                        self.log.truncate_after(entry.index)?;
                        self.log.append(entry.clone())?;
                    }
                    // Covered by the snapshot: committed, nothing to do.
                    Err(_) => continue,
                }
            } else {
                self.log.append(entry.clone())?;
            }
        }
        Ok(AppendEntriesResponse::accepted(current))
    }

    /// Heartbeat: adopt the leader's commit index (clamped to what we hold)
    /// and drive the apply loop and the compaction check.
    fn accept_heartbeat(
        &self,
        request: &AppendEntriesRequest,
        current: Term,
    ) -> Result<AppendEntriesResponse> {
        if request.leader_commit > self.soft.commit_index() {
            let clamp = request.leader_commit.min(request.prev_log_index.next());
            if self.soft.advance_commit(clamp) {
                tracing::trace!(commit = %self.soft.commit_index(), "commit index advanced");
            }
            self.apply_committed()?;
        }
        self.check_snapshot()?;
        Ok(AppendEntriesResponse::accepted(current))
    }

    /// A membership entry: store it like any replicated entry (configuration
    /// entries are log entries, and the next one's consistency check builds
    /// on this slot), then adopt the serialized peer map wholesale.
    fn accept_config(
        &self,
        request: &AppendEntriesRequest,
        current: Term,
    ) -> Result<AppendEntriesResponse> {
        let Some(entry) = request.entries.first().cloned() else {
            return Err(RaftError::Internal {
                reason: "config append without an entry".to_string(),
            });
        };
        let response = self.accept_entries(request, current)?;
        self.peers.replace_from_bytes(&entry.data)?;
        tracing::info!(peers = self.peers.count(), "configuration replaced");
        if !self.peers.contains(self.peers.me()) {
            tracing::info!("removed from the configuration, signalling exit");
            self.request_exit();
        }
        Ok(response)
    }

    /// TimeoutNow: start an election immediately (leadership transfer).
    fn accept_timeout_now(&self, current: Term) -> Result<AppendEntriesResponse> {
        if self.role.get() == Role::Learner {
            tracing::debug!("learner refusing timeout-now");
            return Ok(AppendEntriesResponse::rejected(current));
        }
        tracing::info!("timeout-now received, becoming candidate");
        self.role.set(Role::Candidate);
        Ok(AppendEntriesResponse::accepted(current))
    }

    /// Promote: a caught-up learner becomes a follower. Repeating the
    /// promotion against a node that already turned follower succeeds, so a
    /// retried RPC converges.
    fn accept_promote(
        &self,
        request: &AppendEntriesRequest,
        current: Term,
    ) -> Result<AppendEntriesResponse> {
        match self.role.get() {
            Role::Learner => {
                self.hard.set_term(request.term)?;
                self.role.set(Role::Follower);
                tracing::info!(term = %request.term, "promoted from learner to follower");
                Ok(AppendEntriesResponse::accepted(self.hard.current_term()))
            }
            Role::Follower => Ok(AppendEntriesResponse::accepted(current)),
            _ => Ok(AppendEntriesResponse::rejected(current)),
        }
    }

    /// Handle RequestVote for both election phases.
    pub fn handle_request_vote(
        &self,
        request: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let current = self.hard.current_term();

        // Learners have no say in elections.
        if self.role.get() == Role::Learner {
            return Ok(RequestVoteResponse {
                term: current,
                vote_granted: false,
            });
        }

        let log_ok = |last_term: Term, last_index: LogIndex| {
            request.last_log_term > last_term
                || (request.last_log_term == last_term && request.last_log_index >= last_index)
        };

        if request.pre_vote {
            // Willingness probe: binds nobody, persists nothing.
            let granted =
                request.term >= current && log_ok(self.log.last_term(), self.log.last_index());
            tracing::trace!(candidate = %request.candidate_id, granted, "pre-vote");
            return Ok(RequestVoteResponse {
                term: current,
                vote_granted: granted,
            });
        }

        if request.term < current {
            tracing::debug!(candidate = %request.candidate_id, term = %current,
                request_term = %request.term, "refusing vote for stale candidate");
            return Ok(RequestVoteResponse {
                term: current,
                vote_granted: false,
            });
        }

        if request.term > current {
            self.hard.set_term(request.term)?;
            if matches!(self.role.get(), Role::Leader | Role::Candidate) {
                self.role.set(Role::Follower);
            }
        }
        let current = self.hard.current_term();

        let mut granted = false;
        let voted_for = self.hard.voted_for();
        if voted_for.is_none() || voted_for.as_ref() == Some(&request.candidate_id) {
            if log_ok(self.log.last_term(), self.log.last_index()) {
                self.hard.record_vote(&request.candidate_id)?;
                granted = true;
                tracing::debug!(candidate = %request.candidate_id, term = %current, "vote granted");
            } else {
                tracing::debug!(candidate = %request.candidate_id, "candidate log not up to date");
            }
        }

        if granted {
            self.timers.reset_election_timer();
        }
        Ok(RequestVoteResponse {
            term: current,
            vote_granted: granted,
        })
    }

    /// Handle InstallSnapshot from the leader.
    pub fn handle_install_snapshot(
        &self,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let current = self.hard.current_term();
        if request.term < current {
            tracing::debug!(request_term = %request.term, term = %current,
                "rejecting snapshot from stale leader");
            return Ok(InstallSnapshotResponse { term: current });
        }

        // Step down before anything durable happens.
        if request.term > current {
            self.hard.set_term(request.term)?;
        }
        match self.role.get() {
            Role::Leader if request.term > current => self.role.set(Role::Follower),
            Role::Candidate => self.role.set(Role::Follower),
            _ => {}
        }
        let current = self.hard.current_term();

        self.timers.reset_election_timer();
        self.peers.set_leader(request.leader_id.clone());

        // The truncation decision needs the pre-install view of the log.
        let covered_entry_matches = self
            .log
            .entry(request.last_included_index)
            .map(|entry| entry.term == request.last_included_term)
            .unwrap_or(false);

        let done = self.snapshot.absorb_chunk(
            request.last_included_index,
            request.last_included_term,
            request.offset,
            &request.data,
            request.done,
        )?;
        if !done {
            return Ok(InstallSnapshotResponse { term: current });
        }

        if covered_entry_matches {
            self.log
                .truncate_before(request.last_included_index.next())?;
            tracing::debug!(last_included = %request.last_included_index,
                "snapshot installed, covered prefix dropped");
        } else {
            self.log.clear()?;
            tracing::debug!(last_included = %request.last_included_index,
                "snapshot installed, local log discarded");
        }
        // The snapshot is applied state; both volatile indices move past it.
        self.soft.install_floor(request.last_included_index);

        Ok(InstallSnapshotResponse { term: current })
    }

    /// Apply committed entries to the state machine, in order and at most
    /// once per index. ChangeConf payloads are configuration, not commands:
    /// they refresh the peer registry (a node that replayed them during
    /// catch-up learns the membership here) and never reach the state
    /// machine.
    pub(crate) fn apply_committed(&self) -> Result<()> {
        while self.soft.commit_index() > self.soft.last_applied() {
            let next = self.soft.last_applied().next();
            let entry = self.log.entry(next)?;
            match entry.kind {
                EntryKind::Replicate => {
                    self.fsm.lock().apply(&entry.data)?;
                }
                EntryKind::ChangeConf => {
                    self.peers.replace_from_bytes(&entry.data)?;
                    if !self.peers.contains(self.peers.me()) {
                        tracing::info!("applied a configuration without this node, signalling exit");
                        self.request_exit();
                    }
                }
                _ => {}
            }
            self.soft.mark_applied(next);
            tracing::trace!(index = %next, "entry applied");
        }
        Ok(())
    }

    /// Generate a snapshot and drop the covered prefix once the committed
    /// span since the last snapshot reaches the threshold.
    pub(crate) fn check_snapshot(&self) -> Result<()> {
        if !self.snapshot.should_compact(self.soft.commit_index()) {
            return Ok(());
        }
        let last_applied = self.soft.last_applied();
        if last_applied <= self.snapshot.last_index() {
            return Ok(());
        }
        let data = self.fsm.lock().serialize()?;
        let snapshot = Snapshot::new(last_applied, self.hard.current_term(), data);
        tracing::info!(last_index = %snapshot.last_index, "generating snapshot");
        self.snapshot.install(snapshot)?;
        self.log.truncate_before(last_applied.next())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::RaftConfig;
    use crate::fsm::VecStateMachine;
    use crate::persist::InMemoryPersister;
    use crate::raft::{Raft, RaftNode};
    use crate::transport::InMemoryTransport;
    use crate::types::*;
    use bytes::Bytes;
    use std::sync::Arc;

    fn test_node_with(config: RaftConfig, ids: &[&str]) -> Arc<RaftNode> {
        let me = NodeId::new(ids[0]);
        let peers: PeerMap = ids
            .iter()
            .map(|id| (NodeId::new(*id), NodeAddr::new(format!("addr-{}", id))))
            .collect();
        let persister = Arc::new(InMemoryPersister::new());
        let raft = Raft::new(
            me,
            config,
            peers,
            Arc::new(InMemoryTransport::new()),
            Box::new(VecStateMachine::default()),
            persister.clone(),
            persister,
        )
        .unwrap();
        raft.node().clone()
    }

    fn test_node(ids: &[&str]) -> Arc<RaftNode> {
        test_node_with(RaftConfig::default(), ids)
    }

    fn entry(index: u64, term: u64) -> Entry {
        Entry::new(
            LogIndex(index),
            Term(term),
            EntryKind::Replicate,
            Bytes::from(format!("cmd{}", index)),
        )
    }

    fn heartbeat(term: u64, prev_index: u64, prev_term: u64, commit: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            kind: EntryKind::Heartbeat,
            term: Term(term),
            leader_id: NodeId::new("n2"),
            prev_log_index: LogIndex(prev_index),
            prev_log_term: Term(prev_term),
            entries: vec![],
            leader_commit: LogIndex(commit),
        }
    }

    fn replicate(term: u64, prev_index: u64, prev_term: u64, e: Entry) -> AppendEntriesRequest {
        AppendEntriesRequest {
            kind: EntryKind::Replicate,
            term: Term(term),
            leader_id: NodeId::new("n2"),
            prev_log_index: LogIndex(prev_index),
            prev_log_term: Term(prev_term),
            entries: vec![e],
            leader_commit: LogIndex::ZERO,
        }
    }

    fn vote(term: u64, candidate: &str, last_index: u64, last_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term: Term(term),
            candidate_id: NodeId::new(candidate),
            last_log_index: LogIndex(last_index),
            last_log_term: Term(last_term),
            pre_vote: false,
        }
    }

    #[test]
    fn test_append_entries_rejects_stale_term() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.hard.set_term(Term(5)).unwrap();

        let response = node.handle_append_entries(&heartbeat(3, 0, 0, 0)).unwrap();
        assert!(!response.success);
        assert_eq!(response.term, Term(5));
    }

    #[test]
    fn test_append_entries_adopts_higher_term_and_demotes_candidate() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.role.set(Role::Candidate);
        node.hard.record_vote(&NodeId::new("n1")).unwrap();

        let response = node.handle_append_entries(&heartbeat(4, 0, 0, 0)).unwrap();
        assert!(response.success);
        assert_eq!(node.current_term(), Term(4));
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.hard.voted_for(), None);
        assert_eq!(node.leader(), Some(NodeId::new("n2")));
    }

    #[test]
    fn test_append_entries_missing_prev_returns_tail_hint() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.log.append(entry(1, 1)).unwrap();
        node.log.append(entry(2, 1)).unwrap();

        // Leader thinks we hold 5 entries; we answer with our actual tail.
        let response = node.handle_append_entries(&heartbeat(1, 5, 1, 0)).unwrap();
        assert!(!response.success);
        assert_eq!(response.conflict_term, Some(Term(1)));
        assert_eq!(response.conflict_start_index, Some(LogIndex(2)));
    }

    #[test]
    fn test_append_entries_empty_log_hint_is_zero() {
        let node = test_node(&["n1", "n2", "n3"]);
        let response = node.handle_append_entries(&heartbeat(1, 3, 1, 0)).unwrap();
        assert!(!response.success);
        assert_eq!(response.conflict_term, Some(Term::ZERO));
        assert_eq!(response.conflict_start_index, Some(LogIndex::ZERO));
    }

    #[test]
    fn test_append_entries_term_mismatch_scans_conflict_run() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.hard.set_term(Term(3)).unwrap();
        node.log.append(entry(1, 1)).unwrap();
        node.log.append(entry(2, 2)).unwrap();
        node.log.append(entry(3, 2)).unwrap();

        // Leader claims term 3 at index 3; we hold a run of term 2 from index 2.
        let response = node.handle_append_entries(&heartbeat(3, 3, 3, 0)).unwrap();
        assert!(!response.success);
        assert_eq!(response.conflict_term, Some(Term(2)));
        assert_eq!(response.conflict_start_index, Some(LogIndex(2)));
    }

    #[test]
    fn test_replicate_appends_and_is_idempotent() {
        let node = test_node(&["n1", "n2", "n3"]);
        let request = replicate(1, 0, 0, entry(1, 1));

        let first = node.handle_append_entries(&request).unwrap();
        assert!(first.success);
        assert_eq!(node.last_log_index(), LogIndex(1));

        // Same request again: same reply, same state.
        let second = node.handle_append_entries(&request).unwrap();
        assert!(second.success);
        assert_eq!(node.last_log_index(), LogIndex(1));
        assert_eq!(node.commit_index(), LogIndex::ZERO);
    }

    #[test]
    fn test_replicate_truncates_conflicting_suffix() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.log.append(entry(1, 1)).unwrap();
        node.log.append(entry(2, 1)).unwrap();

        // New leader at term 2 overwrites index 2.
        let replacement = Entry::new(LogIndex(2), Term(2), EntryKind::Replicate, Bytes::from("new"));
        let response = node
            .handle_append_entries(&replicate(2, 1, 1, replacement.clone()))
            .unwrap();
        assert!(response.success);
        assert_eq!(node.log.entry(LogIndex(2)).unwrap(), replacement);
        assert_eq!(node.last_log_index(), LogIndex(2));
    }

    #[test]
    fn test_heartbeat_advances_commit_and_applies() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.log.append(entry(1, 1)).unwrap();
        node.log.append(entry(2, 1)).unwrap();

        let response = node.handle_append_entries(&heartbeat(1, 2, 1, 2)).unwrap();
        assert!(response.success);
        assert_eq!(node.commit_index(), LogIndex(2));
        assert_eq!(node.last_applied(), LogIndex(2));
    }

    #[test]
    fn test_heartbeat_clamps_commit_to_prev_plus_one() {
        let node = test_node(&["n1", "n2", "n3"]);
        for i in 1..=3 {
            node.log.append(entry(i, 1)).unwrap();
        }

        // A garbled commit index never drags us past the consistency point.
        let response = node.handle_append_entries(&heartbeat(1, 2, 1, 7)).unwrap();
        assert!(response.success);
        assert_eq!(node.commit_index(), LogIndex(3));
        assert_eq!(node.last_applied(), LogIndex(3));
    }

    #[test]
    fn test_change_conf_replaces_registry() {
        let node = test_node(&["n1", "n2", "n3"]);
        let mut smaller = PeerMap::new();
        smaller.insert(NodeId::new("n1"), NodeAddr::new("addr-n1"));
        smaller.insert(NodeId::new("n2"), NodeAddr::new("addr-n2"));
        let data = crate::peers::encode_peer_map(&smaller).unwrap();

        let request = AppendEntriesRequest {
            kind: EntryKind::ChangeConf,
            term: Term(1),
            leader_id: NodeId::new("n2"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![Entry::new(LogIndex(1), Term(1), EntryKind::ChangeConf, data)],
            leader_commit: LogIndex::ZERO,
        };
        let response = node.handle_append_entries(&request).unwrap();
        assert!(response.success);
        assert_eq!(node.peers.count(), 2);
        assert_eq!(node.peers.majority(), 2);
        // The configuration entry is a log entry like any other.
        assert_eq!(node.last_log_index(), LogIndex(1));
    }

    #[test]
    fn test_change_conf_removing_self_signals_exit() {
        let node = test_node(&["n1", "n2", "n3"]);
        let mut exit_rx = node.exit.subscribe();

        let mut without_me = PeerMap::new();
        without_me.insert(NodeId::new("n2"), NodeAddr::new("addr-n2"));
        without_me.insert(NodeId::new("n3"), NodeAddr::new("addr-n3"));
        let data = crate::peers::encode_peer_map(&without_me).unwrap();

        let request = AppendEntriesRequest {
            kind: EntryKind::ChangeConf,
            term: Term(1),
            leader_id: NodeId::new("n2"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![Entry::new(LogIndex(1), Term(1), EntryKind::ChangeConf, data)],
            leader_commit: LogIndex::ZERO,
        };
        node.handle_append_entries(&request).unwrap();
        assert!(exit_rx.try_recv().is_ok());
    }

    #[test]
    fn test_timeout_now_starts_candidacy() {
        let node = test_node(&["n1", "n2", "n3"]);
        let request = AppendEntriesRequest {
            kind: EntryKind::TimeoutNow,
            term: Term(1),
            leader_id: NodeId::new("n2"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };
        let response = node.handle_append_entries(&request).unwrap();
        assert!(response.success);
        assert_eq!(node.role(), Role::Candidate);
    }

    #[test]
    fn test_promote_upgrades_learner() {
        let mut config = RaftConfig::default();
        config.initial_role = Role::Learner;
        let node = test_node_with(config, &["n4", "n1", "n2"]);
        assert_eq!(node.role(), Role::Learner);

        let request = AppendEntriesRequest {
            kind: EntryKind::Promote,
            term: Term(3),
            leader_id: NodeId::new("n1"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };
        let response = node.handle_append_entries(&request).unwrap();
        assert!(response.success);
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.current_term(), Term(3));

        // A retried promotion converges instead of failing forever.
        let again = node.handle_append_entries(&request).unwrap();
        assert!(again.success);
    }

    #[test]
    fn test_learner_never_votes_or_campaigns() {
        let mut config = RaftConfig::default();
        config.initial_role = Role::Learner;
        let node = test_node_with(config, &["n4", "n1", "n2"]);

        let response = node.handle_request_vote(&vote(5, "n2", 10, 4)).unwrap();
        assert!(!response.vote_granted);

        let timeout_now = AppendEntriesRequest {
            kind: EntryKind::TimeoutNow,
            term: Term(1),
            leader_id: NodeId::new("n1"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };
        let response = node.handle_append_entries(&timeout_now).unwrap();
        assert!(!response.success);
        assert_eq!(node.role(), Role::Learner);
    }

    #[test]
    fn test_request_vote_grants_once_per_term() {
        let node = test_node(&["n1", "n2", "n3"]);

        let granted = node.handle_request_vote(&vote(2, "n2", 0, 0)).unwrap();
        assert!(granted.vote_granted);
        assert_eq!(node.hard.voted_for(), Some(NodeId::new("n2")));

        // Same term, different candidate: refused.
        let refused = node.handle_request_vote(&vote(2, "n3", 0, 0)).unwrap();
        assert!(!refused.vote_granted);

        // Same candidate retries: still granted.
        let again = node.handle_request_vote(&vote(2, "n2", 0, 0)).unwrap();
        assert!(again.vote_granted);
    }

    #[test]
    fn test_request_vote_rejects_stale_log() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.log.append(entry(1, 1)).unwrap();
        node.log.append(entry(2, 2)).unwrap();
        node.hard.set_term(Term(2)).unwrap();

        // Candidate's log ends at (1, term 1): behind ours.
        let refused = node.handle_request_vote(&vote(3, "n2", 1, 1)).unwrap();
        assert!(!refused.vote_granted);
        // Term was still adopted.
        assert_eq!(node.current_term(), Term(3));

        // A candidate with a longer same-term log wins the comparison.
        let granted = node.handle_request_vote(&vote(3, "n3", 3, 2)).unwrap();
        assert!(granted.vote_granted);
    }

    #[test]
    fn test_pre_vote_persists_nothing() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.hard.set_term(Term(2)).unwrap();
        node.hard.record_vote(&NodeId::new("n3")).unwrap();

        // Willingness is granted even though the vote for this term is spent.
        let mut request = vote(2, "n2", 5, 2);
        request.pre_vote = true;
        let response = node.handle_request_vote(&request).unwrap();
        assert!(response.vote_granted);
        assert_eq!(node.hard.voted_for(), Some(NodeId::new("n3")));
        assert_eq!(node.current_term(), Term(2));

        // A stale pre-vote is refused.
        let mut stale = vote(1, "n2", 5, 2);
        stale.pre_vote = true;
        assert!(!node.handle_request_vote(&stale).unwrap().vote_granted);
    }

    #[test]
    fn test_install_snapshot_rejects_stale_and_steps_down() {
        let node = test_node(&["n1", "n2", "n3"]);
        node.hard.set_term(Term(5)).unwrap();
        node.role.set(Role::Candidate);

        let stale = InstallSnapshotRequest {
            term: Term(3),
            leader_id: NodeId::new("n2"),
            last_included_index: LogIndex(4),
            last_included_term: Term(2),
            offset: 0,
            data: Bytes::from("snap"),
            done: true,
        };
        let response = node.handle_install_snapshot(&stale).unwrap();
        assert_eq!(response.term, Term(5));
        assert!(node.snapshot.current().is_empty());

        let fresh = InstallSnapshotRequest {
            term: Term(6),
            ..stale
        };
        node.handle_install_snapshot(&fresh).unwrap();
        assert_eq!(node.current_term(), Term(6));
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.snapshot.last_index(), LogIndex(4));
    }

    #[test]
    fn test_install_snapshot_truncates_matching_prefix() {
        let node = test_node(&["n1", "n2", "n3"]);
        for i in 1..=4 {
            node.log.append(entry(i, 1)).unwrap();
        }

        let request = InstallSnapshotRequest {
            term: Term(1),
            leader_id: NodeId::new("n2"),
            last_included_index: LogIndex(2),
            last_included_term: Term(1),
            offset: 0,
            data: Bytes::from("snap"),
            done: true,
        };
        node.handle_install_snapshot(&request).unwrap();

        // Entries past the snapshot survive; the prefix is gone.
        assert_eq!(node.last_log_index(), LogIndex(4));
        assert!(node.log.entry(LogIndex(2)).is_err());
        assert!(node.log.entry(LogIndex(3)).is_ok());
        assert_eq!(node.commit_index(), LogIndex(2));
        assert_eq!(node.last_applied(), LogIndex(2));
    }

    #[test]
    fn test_install_snapshot_clears_conflicting_log() {
        let node = test_node(&["n1", "n2", "n3"]);
        for i in 1..=3 {
            node.log.append(entry(i, 1)).unwrap();
        }

        // Snapshot term disagrees with our entry at the boundary.
        let request = InstallSnapshotRequest {
            term: Term(2),
            leader_id: NodeId::new("n2"),
            last_included_index: LogIndex(3),
            last_included_term: Term(2),
            offset: 0,
            data: Bytes::from("snap"),
            done: true,
        };
        node.handle_install_snapshot(&request).unwrap();
        assert_eq!(node.last_log_index(), LogIndex(3));
        assert!(node.log.entry(LogIndex(1)).is_err());
        assert_eq!(node.log.last_term(), Term(2));
    }

    #[test]
    fn test_install_snapshot_chunked_matches_one_shot() {
        let node = test_node(&["n1", "n2", "n3"]);
        let chunk = |offset, data: &str, done| InstallSnapshotRequest {
            term: Term(1),
            leader_id: NodeId::new("n2"),
            last_included_index: LogIndex(2),
            last_included_term: Term(1),
            offset,
            data: Bytes::from(data.to_string()),
            done,
        };

        node.handle_install_snapshot(&chunk(0, "he", false)).unwrap();
        assert_eq!(node.commit_index(), LogIndex::ZERO);
        node.handle_install_snapshot(&chunk(2, "llo", true)).unwrap();

        assert_eq!(node.snapshot.current().data, Bytes::from("hello"));
        assert_eq!(node.commit_index(), LogIndex(2));
    }

    #[test]
    fn test_apply_is_ordered_and_at_most_once() {
        let node = test_node(&["n1", "n2", "n3"]);
        for i in 1..=3 {
            node.log.append(entry(i, 1)).unwrap();
        }
        node.soft.advance_commit(LogIndex(2));
        node.apply_committed().unwrap();
        assert_eq!(node.last_applied(), LogIndex(2));

        // Re-running with the same commit index applies nothing further.
        node.apply_committed().unwrap();
        assert_eq!(node.last_applied(), LogIndex(2));

        node.soft.advance_commit(LogIndex(3));
        node.apply_committed().unwrap();
        assert_eq!(node.last_applied(), LogIndex(3));
    }

    #[test]
    fn test_check_snapshot_compacts_at_threshold() {
        let mut config = RaftConfig::default();
        config.max_log_entries = 3;
        let node = test_node_with(config, &["n1", "n2", "n3"]);
        for i in 1..=4 {
            node.log.append(entry(i, 1)).unwrap();
        }
        node.soft.advance_commit(LogIndex(4));
        node.apply_committed().unwrap();

        node.check_snapshot().unwrap();
        assert_eq!(node.snapshot.last_index(), LogIndex(4));
        assert_eq!(node.snapshot.last_term(), Term(1));
        assert!(node.log.entry(LogIndex(4)).is_err());
        assert_eq!(node.last_log_index(), LogIndex(4));

        // Below threshold again: no new snapshot.
        node.check_snapshot().unwrap();
        assert_eq!(node.snapshot.last_index(), LogIndex(4));
    }
}
