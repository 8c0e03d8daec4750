//! Raft configuration (timeouts, compaction threshold, initial role).

use crate::error::{RaftError, Result};
use crate::types::Role;
use std::time::Duration;

/// Raft configuration.
///
/// Controls election timeouts, the heartbeat interval, the snapshot trigger,
/// and the role a node boots into.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Heartbeat interval (leader → followers).
    ///
    /// The leader sends AppendEntries (heartbeat or real entries) at this
    /// interval. Must be < election_timeout_min to prevent spurious elections.
    /// It also bounds how long RPC fan-outs wait for a majority.
    ///
    /// Default: 150ms
    pub heartbeat_interval: Duration,

    /// Minimum election timeout (follower → candidate).
    ///
    /// If a follower does not hear from the leader within the randomized
    /// timeout it starts an election. Also the deadline for a leadership
    /// transfer.
    ///
    /// Default: 300ms
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Upper bound for the randomized election timeout.
    ///
    /// Default: 600ms
    pub election_timeout_max: Duration,

    /// Snapshot trigger: entry-count threshold.
    ///
    /// A snapshot is generated once `commit_index - snapshot.last_index`
    /// reaches this many entries, and the covered log prefix is dropped.
    ///
    /// Default: 10,000 entries
    pub max_log_entries: u64,

    /// Role the node boots into.
    ///
    /// `Follower` for cluster members; `Learner` for a fresh node catching up
    /// before it is admitted through a membership change.
    ///
    /// Default: Follower
    pub initial_role: Role,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            max_log_entries: 10_000,
            initial_role: Role::Follower,
        }
    }
}

impl RaftConfig {
    /// Validate the configuration (ensure invariants hold).
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config {
                reason: format!(
                    "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                    self.heartbeat_interval, self.election_timeout_min
                ),
            });
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Config {
                reason: format!(
                    "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                    self.election_timeout_min, self.election_timeout_max
                ),
            });
        }

        if self.max_log_entries == 0 {
            return Err(RaftError::Config {
                reason: "max_log_entries must be > 0".to_string(),
            });
        }

        if !matches!(self.initial_role, Role::Follower | Role::Learner) {
            return Err(RaftError::Config {
                reason: format!("initial_role must be Follower or Learner, got {}", self.initial_role),
            });
        }

        Ok(())
    }

    /// Get a randomized election timeout.
    ///
    /// Returns a random duration in [election_timeout_min, election_timeout_max].
    /// Each round draws a fresh value to break split votes.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}
