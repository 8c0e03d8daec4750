//! Vote fan-out and majority accounting.
//!
//! A candidate runs two rounds through the same machinery: a pre-vote with
//! the current term (no persistent mutation), and only if a majority is
//! willing, a real vote with the incremented, persisted term. Fan-out
//! results come back on a channel sized to the peer count; abandoning a round
//! just drops the receiver.

use crate::raft::RaftNode;
use crate::types::{NodeAddr, NodeId, RequestVoteRequest, Term};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Outcome of one outbound RPC inside a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishMsg {
    /// Peer accepted (vote granted / append succeeded).
    Success,
    /// Peer answered but said no (without a higher term).
    Rejected,
    /// The call itself failed.
    RpcFailed,
    /// Peer's term is higher; the initiator must step down.
    Degrade(Term),
    /// Local error while building or interpreting the call.
    Error,
}

/// What a majority wait concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// A majority of the configuration acknowledged.
    Majority,
    /// Everyone answered (or the window closed) short of a majority.
    Short,
    /// Some peer reported a higher term.
    Degraded(Term),
}

/// Fan out RequestVote to every other peer with the node's current term.
///
/// With `pre_vote` set this is the non-binding willingness probe; without it,
/// the real vote for the (already persisted) current term.
pub(crate) fn send_request_votes(node: &Arc<RaftNode>, pre_vote: bool) -> mpsc::Receiver<FinishMsg> {
    let peers = node.peers.peers();
    let (finish_tx, finish_rx) = mpsc::channel(peers.len().max(1));

    let request = RequestVoteRequest {
        term: node.hard.current_term(),
        candidate_id: node.peers.me().clone(),
        last_log_index: node.log.last_index(),
        last_log_term: node.log.last_term(),
        pre_vote,
    };

    for (id, addr) in peers {
        if node.peers.is_me(&id) {
            continue;
        }
        let node = node.clone();
        let request = request.clone();
        let finish_tx = finish_tx.clone();
        tokio::spawn(async move {
            let msg = request_vote_from(&node, &id, &addr, request).await;
            // A dropped receiver means the round was abandoned.
            let _ = finish_tx.send(msg).await;
        });
    }

    finish_rx
}

async fn request_vote_from(
    node: &Arc<RaftNode>,
    id: &NodeId,
    addr: &NodeAddr,
    request: RequestVoteRequest,
) -> FinishMsg {
    let term = request.term;
    tracing::trace!(peer = %id, %term, "requesting vote");
    match node.transport.request_vote(addr, request).await {
        Err(err) => {
            tracing::debug!(peer = %id, error = %err, "vote rpc failed");
            FinishMsg::RpcFailed
        }
        Ok(reply) if reply.vote_granted => {
            tracing::trace!(peer = %id, "vote granted");
            FinishMsg::Success
        }
        Ok(reply) if reply.term > term => {
            tracing::debug!(peer = %id, reply_term = %reply.term, "peer term is ahead");
            FinishMsg::Degrade(reply.term)
        }
        Ok(_) => FinishMsg::Rejected,
    }
}

/// Count fan-out results until a majority is reached, everyone has answered,
/// or `budget` elapses.
///
/// `already_acked` seeds the counters with the initiator's own vote: 1 when
/// the initiator belongs to the configuration being counted, 0 when it does
/// not (e.g. replicating C_new while leaving the cluster).
pub(crate) async fn wait_for_majority(
    rx: &mut mpsc::Receiver<FinishMsg>,
    majority: usize,
    total: usize,
    budget: Duration,
    already_acked: usize,
) -> WaitOutcome {
    let mut successes = already_acked;
    let mut responded = already_acked;

    // A single-node configuration is already at quorum.
    if successes >= majority {
        return WaitOutcome::Majority;
    }

    let deadline = Instant::now() + budget;
    loop {
        let msg = match timeout_at(deadline, rx.recv()).await {
            Err(_) => return WaitOutcome::Short,
            Ok(None) => return WaitOutcome::Short,
            Ok(Some(msg)) => msg,
        };

        if let FinishMsg::Degrade(term) = msg {
            return WaitOutcome::Degraded(term);
        }
        if msg == FinishMsg::Success {
            successes += 1;
            if successes >= majority {
                return WaitOutcome::Majority;
            }
        }
        responded += 1;
        if responded >= total {
            return WaitOutcome::Short;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_wait(msgs: Vec<FinishMsg>, majority: usize, total: usize) -> WaitOutcome {
        let (tx, mut rx) = mpsc::channel(msgs.len().max(1));
        for msg in msgs {
            tx.send(msg).await.unwrap();
        }
        drop(tx);
        wait_for_majority(&mut rx, majority, total, Duration::from_millis(50), 1).await
    }

    #[tokio::test]
    async fn test_majority_of_three() {
        let outcome = run_wait(vec![FinishMsg::Success], 2, 3).await;
        assert_eq!(outcome, WaitOutcome::Majority);
    }

    #[tokio::test]
    async fn test_all_answered_short() {
        let outcome = run_wait(vec![FinishMsg::Rejected, FinishMsg::RpcFailed], 2, 3).await;
        assert_eq!(outcome, WaitOutcome::Short);
    }

    #[tokio::test]
    async fn test_degrade_wins_over_counting() {
        let outcome = run_wait(vec![FinishMsg::Degrade(Term(9)), FinishMsg::Success], 2, 3).await;
        assert_eq!(outcome, WaitOutcome::Degraded(Term(9)));
    }

    #[tokio::test]
    async fn test_single_node_is_instant_majority() {
        let (_tx, mut rx) = mpsc::channel(1);
        let outcome = wait_for_majority(&mut rx, 1, 1, Duration::from_millis(5), 1).await;
        assert_eq!(outcome, WaitOutcome::Majority);
    }

    #[tokio::test]
    async fn test_window_elapses_short() {
        let (_tx, mut rx) = mpsc::channel::<FinishMsg>(1);
        let outcome = wait_for_majority(&mut rx, 2, 3, Duration::from_millis(10), 1).await;
        assert_eq!(outcome, WaitOutcome::Short);
    }
}
