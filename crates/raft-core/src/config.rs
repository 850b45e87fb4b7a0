//! # config
//!
//! why: keep election and heartbeat timing in one validated place
//! relations: owned by RaftNode, read by the peer's timer and replication tasks
//! what: RaftConfig with defaults, validation and randomized election timeouts

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Timing configuration, all values in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// Period of the leader's replication cycle
    pub heartbeat_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}

impl RaftConfig {
    /// Check that timeouts are ordered and heartbeats fire well inside them
    pub fn validate(&self) -> CoreResult<()> {
        if self.heartbeat_interval == 0 {
            return Err(CoreError::Config("heartbeat_interval must be > 0".into()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(CoreError::Config(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval * 2 > self.election_timeout_min {
            return Err(CoreError::Config(format!(
                "heartbeat_interval ({}) should be << election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    /// Draw a fresh election timeout uniformly from the configured range
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }
}
