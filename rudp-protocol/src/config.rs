//! Transport configuration

use crate::rtt::{DEFAULT_RTT_MS, DEFAULT_TIMEOUT_CEILING_MS, MIN_RTT_MS};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("shard_count must be at least 1")]
    NoShards,

    #[error("timeout ceiling {ceiling_ms}ms is below the initial RTT {initial_rtt_ms}ms")]
    CeilingBelowInitialRtt { ceiling_ms: u64, initial_rtt_ms: u64 },

    #[error("{0} must be non-zero")]
    ZeroValue(&'static str),
}

/// Tunables for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Number of receive shards (one producer thread each)
    pub shard_count: usize,
    /// Starting RTT estimate in milliseconds
    pub initial_rtt_ms: u64,
    /// Floor applied whenever the RTT estimate changes
    pub min_rtt_ms: u64,
    /// Backoff ceiling; an RTT estimate above it declares the connection dead
    pub timeout_ceiling_ms: u64,
    /// How often the retransmission scan runs
    pub retransmit_interval_ms: u64,
    /// How often the consumer drains the reorder buffer
    pub drain_interval_ms: u64,
    /// Events an endpoint queues before the oldest are dropped
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            shard_count: 1,
            initial_rtt_ms: DEFAULT_RTT_MS,
            min_rtt_ms: MIN_RTT_MS,
            timeout_ceiling_ms: DEFAULT_TIMEOUT_CEILING_MS,
            retransmit_interval_ms: 1,
            drain_interval_ms: 1,
            event_capacity: 1024,
        }
    }
}

impl TransportConfig {
    /// Config with `shard_count` receive shards and defaults elsewhere
    pub fn with_shards(shard_count: usize) -> Self {
        TransportConfig {
            shard_count,
            ..Default::default()
        }
    }

    /// Check the config for values the engines cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 {
            return Err(ConfigError::NoShards);
        }
        if self.initial_rtt_ms == 0 {
            return Err(ConfigError::ZeroValue("initial_rtt_ms"));
        }
        if self.retransmit_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("retransmit_interval_ms"));
        }
        if self.drain_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("drain_interval_ms"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroValue("event_capacity"));
        }
        if self.timeout_ceiling_ms < self.initial_rtt_ms {
            return Err(ConfigError::CeilingBelowInitialRtt {
                ceiling_ms: self.timeout_ceiling_ms,
                initial_rtt_ms: self.initial_rtt_ms,
            });
        }
        Ok(())
    }

    /// Retransmission scan interval as Duration
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    /// Drain interval as Duration
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}
