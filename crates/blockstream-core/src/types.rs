//! Shared types for the reconciliation pipeline.

use serde::{Deserialize, Serialize};

use crate::number::BlockNumber;

/// A log event produced by a block. Forwarded as-is, never interpreted.
pub type LogRecord = serde_json::Value;

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// Identifies one block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block hash (`0x…`).
    pub hash: String,
    /// Block height.
    pub number: BlockNumber,
}

impl BlockRef {
    pub fn new(hash: impl Into<String>, number: impl Into<BlockNumber>) -> Self {
        Self {
            hash: hash.into(),
            number: number.into(),
        }
    }
}

// ─── BlockRecord ──────────────────────────────────────────────────────────────

/// A stored observation of a block at some height, with the logs it produced.
///
/// Several records may share a height when competing forks were observed;
/// the hash is unique per record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block: BlockRef,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
}

impl BlockRecord {
    pub fn new(block: BlockRef, logs: Vec<LogRecord>) -> Self {
        Self { block, logs }
    }

    pub fn hash(&self) -> &str {
        &self.block.hash
    }

    pub fn number(&self) -> BlockNumber {
        self.block.number
    }
}

// ─── StateRecord ──────────────────────────────────────────────────────────────

/// The persisted canonical head for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub network_id: String,
    pub block_hash: String,
    pub block_number: BlockNumber,
    /// Wall-clock time of the write, epoch milliseconds.
    pub timestamp: i64,
}

impl StateRecord {
    /// The canonical block this record points at.
    pub fn block(&self) -> BlockRef {
        BlockRef {
            hash: self.block_hash.clone(),
            number: self.block_number,
        }
    }

    /// The compare-and-set identity: network, hash and height. The timestamp
    /// is not part of it.
    pub fn same_head(&self, other: &StateRecord) -> bool {
        self.network_id == other.network_id
            && self.block_hash == other.block_hash
            && self.block_number == other.block_number
    }
}

// ─── QueueMessage ─────────────────────────────────────────────────────────────

/// Wire payload on the block queue: the block a notification asserted as
/// canonical for its height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub hash: String,
    pub number: BlockNumber,
}

impl QueueMessage {
    pub fn to_json(&self) -> String {
        // A struct of a string and a number always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}

impl From<BlockRef> for QueueMessage {
    fn from(block: BlockRef) -> Self {
        Self {
            hash: block.hash,
            number: block.number,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
