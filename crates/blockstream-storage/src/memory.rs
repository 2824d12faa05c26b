//! In-memory storage backend.
//!
//! Holds block records and the state record in RAM. Useful for tests and
//! short-lived workers that don't need persistence.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use blockstream_core::error::Result;
use blockstream_core::number::BlockNumber;
use blockstream_core::query::BlockQuery;
use blockstream_core::state::{MemoryStateStore, StateStore};
use blockstream_core::types::{BlockRecord, BlockRef, StateRecord};

/// In-memory block + state storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    blocks: Mutex<Vec<BlockRecord>>,
    state: MemoryStateStore,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed block. Records are append-only: a hash that is
    /// already stored is left untouched and `false` is returned.
    pub fn insert_block(&self, record: BlockRecord) -> bool {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        if blocks.iter().any(|b| b.hash() == record.hash()) {
            return false;
        }
        blocks.push(record);
        true
    }

    /// Total number of stored block records.
    pub fn block_count(&self) -> usize {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl BlockQuery for InMemoryStorage {
    async fn blocks_matching_number(&self, number: BlockNumber) -> Result<Vec<BlockRecord>> {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(blocks
            .iter()
            .filter(|b| b.number() == number)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StateStore for InMemoryStorage {
    async fn current_state(&self, network_id: &str) -> Result<Option<StateRecord>> {
        self.state.current_state(network_id).await
    }

    async fn advance_state(
        &self,
        network_id: &str,
        previous: Option<&StateRecord>,
        next: &BlockRef,
    ) -> Result<StateRecord> {
        self.state.advance_state(network_id, previous, next).await
    }
}
