//! Election and heartbeat timing.
//!
//! One deadline serves whichever role is running: followers and candidates
//! arm it with a randomized election timeout, the leader with the fixed
//! heartbeat interval. Handlers re-arm it (e.g. on valid AppendEntries) and
//! the role loop's `tick` observes the moved deadline on its next wakeup.

use crate::config::RaftConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Shared deadline timer for the role loops.
pub struct TimerState {
    config: RaftConfig,
    deadline: Mutex<Instant>,
}

impl TimerState {
    pub fn new(config: RaftConfig) -> Self {
        let initial = Instant::now() + config.random_election_timeout();
        Self {
            config,
            deadline: Mutex::new(initial),
        }
    }

    /// Arm the timer with a fresh randomized election timeout.
    pub fn reset_election_timer(&self) {
        *self.deadline.lock() = Instant::now() + self.config.random_election_timeout();
    }

    /// Arm the timer with the heartbeat interval.
    pub fn reset_heartbeat_timer(&self) {
        *self.deadline.lock() = Instant::now() + self.config.heartbeat_interval;
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    pub fn min_election_timeout(&self) -> Duration {
        self.config.election_timeout_min
    }

    /// Wait until the current deadline passes.
    ///
    /// Re-reads the deadline after every wakeup, so a reset that pushed it
    /// further out simply extends the sleep.
    pub async fn tick(&self) {
        loop {
            let deadline = *self.deadline.lock();
            if Instant::now() >= deadline {
                return;
            }
            sleep_until(deadline).await;
        }
    }
}
