//! Leader-side membership change (joint consensus), learner registration,
//! and leadership transfer.
//!
//! A membership change runs to completion on the role-loop task, so two
//! changes can never interleave. The joint entry C(old,new) must be
//! acknowledged by majorities of *both* the old and the new configuration
//! before C(new) goes out; the final commit covers both entries at once.

use crate::election::{wait_for_majority, FinishMsg, WaitOutcome};
use crate::error::{RaftError, Result};
use crate::peers::encode_peer_map;
use crate::raft::RaftNode;
use crate::replication::{fan_out, replication_to, FollowerRole, Transfer};
use crate::types::*;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

impl RaftNode {
    /// Drive a full joint-consensus membership change to `request.peers`.
    pub(crate) async fn handle_change_config(
        self: &Arc<Self>,
        request: ChangeConfigRequest,
    ) -> Result<ChangeConfigResponse> {
        let new_peers = request.peers;
        if new_peers.is_empty() {
            return Err(RaftError::Config {
                reason: "target configuration is empty".to_string(),
            });
        }

        let old_peers = self.peers.peers();
        let mut joint = old_peers.clone();
        joint.extend(new_peers.iter().map(|(id, addr)| (id.clone(), addr.clone())));
        tracing::info!(
            old = old_peers.len(),
            new = new_peers.len(),
            joint = joint.len(),
            "membership change started"
        );

        // Nodes entering the cluster need replication workers before any
        // configuration round can reach them.
        for (id, addr) in &joint {
            if !self.peers.is_me(id) && !self.leader.contains(id) {
                self.add_replication(id.clone(), addr.clone(), FollowerRole::Follower);
            }
        }

        // Phase 1: C(old,new), acknowledged by majorities of both halves.
        self.append_config_entry(&joint)?;
        self.peers.replace(joint.clone());
        self.config_round(&old_peers).await?;
        self.config_round(&new_peers).await?;
        tracing::debug!("joint configuration acknowledged by both halves");

        // Phase 2: C(new), acknowledged by a majority of the new config.
        self.append_config_entry(&new_peers)?;
        self.peers.replace(new_peers.clone());
        self.config_round(&new_peers).await?;

        // Both configuration entries commit together.
        self.soft.advance_commit(self.log.last_index());
        self.apply_committed()?;
        self.check_snapshot()?;

        if !new_peers.contains_key(self.peers.me()) {
            tracing::info!("not part of the new configuration, leaving the cluster");
            self.request_exit();
            return Ok(ChangeConfigResponse { success: true });
        }

        self.leader.retain_members(&new_peers);
        tracing::info!(peers = new_peers.len(), "membership change committed");
        Ok(ChangeConfigResponse { success: true })
    }

    /// Append a ChangeConf entry carrying the serialized peer map.
    fn append_config_entry(&self, peers: &PeerMap) -> Result<()> {
        let data = encode_peer_map(peers)?;
        let entry = Entry::new(
            self.log.last_index().next(),
            self.hard.current_term(),
            EntryKind::ChangeConf,
            data,
        );
        self.log.append(entry)
    }

    /// Replicate the freshly appended configuration entry to `subset` and
    /// wait for a majority of that subset.
    async fn config_round(self: &Arc<Self>, subset: &PeerMap) -> Result<()> {
        let majority = subset.len() / 2 + 1;
        let already = usize::from(subset.contains_key(self.peers.me()));
        let mut rx = fan_out(self, EntryKind::ChangeConf, subset, false);
        match wait_for_majority(
            &mut rx,
            majority,
            subset.len(),
            self.timers.heartbeat_interval(),
            already,
        )
        .await
        {
            WaitOutcome::Majority => Ok(()),
            WaitOutcome::Short => {
                tracing::warn!("configuration round fell short of a majority");
                Err(RaftError::NoQuorum)
            }
            WaitOutcome::Degraded(term) => {
                self.become_follower(term)?;
                Err(RaftError::NotLeader {
                    leader: self.peers.leader(),
                })
            }
        }
    }

    /// Register a fresh node as a learner and kick off its catch-up.
    /// It joins the peer registry only once its worker promotes it, and
    /// becomes a full voter only through a later membership change.
    pub(crate) fn handle_add_new_node(
        self: &Arc<Self>,
        request: AddNewNodeRequest,
    ) -> Result<AddNewNodeResponse> {
        if self.peers.is_me(&request.id) {
            return Err(RaftError::Config {
                reason: "cannot add self as a learner".to_string(),
            });
        }
        let repl = match self.leader.replication(&request.id) {
            Some(repl) => repl,
            None => self.add_replication(request.id.clone(), request.addr.clone(), FollowerRole::Learner),
        };
        tracing::info!(learner = %request.id, "learner registered, triggering catch-up");
        repl.trigger();
        Ok(AddNewNodeResponse { success: true })
    }

    /// Start a leadership transfer. The reply is deferred until the transfer
    /// completes, fails, or times out.
    pub(crate) async fn handle_transfer(
        self: &Arc<Self>,
        request: TransferLeadershipRequest,
        reply: oneshot::Sender<Result<TransferLeadershipResponse>>,
    ) {
        if self.peers.is_me(&request.transferee) {
            let _ = reply.send(Ok(TransferLeadershipResponse { success: true }));
            return;
        }
        if self.leader.replication(&request.transferee).is_none() {
            let _ = reply.send(Err(RaftError::Config {
                reason: format!("unknown transferee {}", request.transferee),
            }));
            return;
        }

        let deadline = Instant::now() + self.timers.min_election_timeout();
        tracing::info!(transferee = %request.transferee, "leadership transfer started");
        self.leader.set_transfer(Transfer {
            transferee: request.transferee.clone(),
            deadline,
            reply,
        });
        self.check_transfer(&request.transferee).await;
    }

    /// Advance the active transfer on a progress event: fail it past the
    /// deadline, wait while the target is busy, trigger catch-up while it is
    /// behind, and send TimeoutNow the moment it is level.
    pub(crate) async fn check_transfer(self: &Arc<Self>, id: &NodeId) {
        let Some((target, deadline)) = self.leader.transfer_target() else {
            return;
        };
        if target != *id {
            return;
        }

        if Instant::now() >= deadline {
            tracing::warn!(transferee = %target, "leadership transfer timed out");
            if let Some(transfer) = self.leader.take_transfer() {
                let _ = transfer
                    .reply
                    .send(Ok(TransferLeadershipResponse { success: false }));
            }
            return;
        }

        let Some(repl) = self.leader.replication(&target) else {
            if let Some(transfer) = self.leader.take_transfer() {
                let _ = transfer
                    .reply
                    .send(Ok(TransferLeadershipResponse { success: false }));
            }
            return;
        };

        if repl.busy() {
            // Catch-up in flight; the caught-up signal re-enters here.
            return;
        }

        if repl.match_index() == self.log.last_index() {
            tracing::debug!(transferee = %target, "target is level, sending timeout-now");
            match replication_to(self, &repl, EntryKind::TimeoutNow).await {
                FinishMsg::Success => {
                    tracing::info!(transferee = %target, "leadership transferred");
                    let term = self.hard.current_term();
                    if self.become_follower(term).is_ok() {
                        if let Some(transfer) = self.leader.take_transfer() {
                            let _ = transfer
                                .reply
                                .send(Ok(TransferLeadershipResponse { success: true }));
                        }
                    }
                }
                FinishMsg::Degrade(term) => {
                    let _ = self.become_follower(term);
                    if let Some(transfer) = self.leader.take_transfer() {
                        let _ = transfer
                            .reply
                            .send(Ok(TransferLeadershipResponse { success: false }));
                    }
                }
                // Transient; retried on the next progress event until the
                // deadline clears it.
                _ => {}
            }
        } else {
            tracing::debug!(transferee = %target, match_index = %repl.match_index(),
                "target behind, triggering catch-up");
            repl.trigger();
        }
    }
}
