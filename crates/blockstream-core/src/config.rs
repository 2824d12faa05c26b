//! Drain worker configuration.

use serde::{Deserialize, Serialize};

use crate::error::{BlockstreamError, Result};
use crate::retry::RetryConfig;

/// Configuration for a [`DrainWorker`](crate::drain::DrainWorker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Network whose state record this worker maintains (e.g. `"mainnet"`).
    pub network_id: String,
    /// Maximum messages requested per poll.
    pub batch_size: usize,
    /// Sleep between polls that return nothing (milliseconds).
    pub poll_interval_ms: u64,
    /// Deliveries after which a message is dead-lettered instead of
    /// processed. `None` redelivers forever.
    pub max_receive_count: Option<u32>,
    /// Retry policy for acknowledgements.
    pub ack_retry: RetryConfig,
    /// Re-reads allowed after losing a state compare-and-set.
    pub max_state_retries: u32,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            network_id: "mainnet".into(),
            batch_size: 10,
            poll_interval_ms: 1_000,
            max_receive_count: Some(5),
            ack_retry: RetryConfig::default(),
            max_state_retries: 3,
        }
    }
}

impl DrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.network_id.trim().is_empty() {
            return Err(BlockstreamError::Config("network_id must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(BlockstreamError::Config("batch_size must be at least 1".into()));
        }
        if self.max_receive_count == Some(0) {
            return Err(BlockstreamError::Config(
                "max_receive_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
