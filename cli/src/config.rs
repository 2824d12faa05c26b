//! Worker configuration: optional JSON file, then environment overrides.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use blockstream_core::DrainConfig;

use crate::logging::LogConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// SQLite file holding blocks, state and queues.
    pub database: String,
    pub block_queue: String,
    pub log_queue: String,
    pub visibility_timeout_secs: u64,
    pub drain: DrainConfig,
    pub log: LogConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database: "./blockstream.db".into(),
            block_queue: "blocks".into(),
            log_queue: "logs".into(),
            visibility_timeout_secs: 30,
            drain: DrainConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from `path` (defaults when `None`), apply process environment
    /// overrides, and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.drain.validate()?;
        Ok(config)
    }

    /// `BLOCKSTREAM_NETWORK_ID`, `BLOCKSTREAM_DATABASE` and `LOG_JSON`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(network) = var("BLOCKSTREAM_NETWORK_ID") {
            self.drain.network_id = network;
        }
        if let Some(database) = var("BLOCKSTREAM_DATABASE") {
            self.database = database;
        }
        if let Some(json) = var("LOG_JSON") {
            self.log.json = matches!(json.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }
}
