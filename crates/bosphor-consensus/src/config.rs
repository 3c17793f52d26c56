use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;

/// Largest exponent used for the round-change backoff
const MAX_BACKOFF_EXPONENT: u64 = 10;

/// Policy used to pick the proposer of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposerPolicy {
    /// Rotate to the next validator after every block and every round change
    #[default]
    RoundRobin,
    /// Keep the last proposer until a round change deposes it
    Sticky,
}

/// Consensus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Timeout for each round in milliseconds
    pub request_timeout_ms: u64,
    /// Minimum difference between two consecutive block timestamps in seconds
    pub block_period_s: u64,
    /// Delay before proposing an empty block in seconds (must exceed block_period_s)
    pub block_pause_time_s: u64,
    /// Proposer selection policy
    pub proposer_policy: ProposerPolicy,
    /// Number of blocks between validator set checkpoints
    pub epoch: u64,
    /// Maximum number of concurrent proposal verifications
    pub verify_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            request_timeout_ms: 10_000,
            block_period_s: 1,
            block_pause_time_s: 2,
            proposer_policy: ProposerPolicy::RoundRobin,
            epoch: 30_000,
            verify_workers: 4,
        }
    }
}

impl Config {
    /// Check the invariants the engine relies on
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.request_timeout_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.block_pause_time_s <= self.block_period_s {
            return Err(ConsensusError::InvalidConfig(format!(
                "block_pause_time_s ({}) must exceed block_period_s ({})",
                self.block_pause_time_s, self.block_period_s
            )));
        }
        if self.epoch == 0 {
            return Err(ConsensusError::InvalidConfig(
                "epoch must be positive".to_string(),
            ));
        }
        if self.verify_workers == 0 {
            return Err(ConsensusError::InvalidConfig(
                "verify_workers must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn block_period(&self) -> Duration {
        Duration::from_secs(self.block_period_s)
    }

    pub fn block_pause_time(&self) -> Duration {
        Duration::from_secs(self.block_pause_time_s)
    }

    /// Round-change timer for `round`: the request timeout, plus 2^round
    /// seconds once the first round has failed
    pub fn round_change_timeout(&self, round: u64) -> Duration {
        let base = self.request_timeout();
        if round == 0 {
            return base;
        }
        base + Duration::from_secs(1 << round.min(MAX_BACKOFF_EXPONENT))
    }
}
