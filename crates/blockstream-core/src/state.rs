//! State store: the single persisted canonical-head record per network.
//!
//! Writers may be separate processes, so the record is never guarded by a
//! lock. Every write after the first is a compare-and-set against the record
//! the writer last read; a writer that loses the race sees
//! [`BlockstreamError::ConcurrentUpdate`] and must re-read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{BlockstreamError, Result};
use crate::reconcile::{head_decision, HeadDecision};
use crate::types::{BlockRef, StateRecord};

/// Persistence for [`StateRecord`]s.
///
/// Implementations: [`MemoryStateStore`] here, `SqliteStorage` in
/// `blockstream-storage`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Strongly consistent read of the current record, `None` if the network
    /// has no state yet. Transport failures surface as
    /// [`BlockstreamError::StoreUnavailable`] and are not retried here.
    async fn current_state(&self, network_id: &str) -> Result<Option<StateRecord>>;

    /// Write `next` as the canonical head.
    ///
    /// With `previous == None` the write is a plain put. Otherwise it only
    /// succeeds if the stored record still has the same network, hash and
    /// height as `previous`; if not, fails with
    /// [`BlockstreamError::ConcurrentUpdate`]. The timestamp is set to the
    /// wall-clock time of the write.
    async fn advance_state(
        &self,
        network_id: &str,
        previous: Option<&StateRecord>,
        next: &BlockRef,
    ) -> Result<StateRecord>;
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Result of [`StateManager::reconcile_head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadUpdate {
    /// First record for the network.
    Created(StateRecord),
    /// The head moved to a new block.
    Advanced {
        previous: StateRecord,
        current: StateRecord,
    },
    /// The head already pointed at the reconciled block.
    Unchanged(StateRecord),
    /// The reconciled block is below the head; nothing was written.
    Stale(StateRecord),
    /// Every compare-and-set attempt lost to another writer. Holds the record
    /// that writer left behind; nothing was written here.
    Superseded(StateRecord),
}

impl HeadUpdate {
    /// The record persisted after the update.
    pub fn head(&self) -> &StateRecord {
        match self {
            Self::Created(r) | Self::Unchanged(r) | Self::Stale(r) | Self::Superseded(r) => r,
            Self::Advanced { current, .. } => current,
        }
    }

    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created(_) | Self::Advanced { .. })
    }
}

/// Binds a [`StateStore`] to the process-wide network id.
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn StateStore>,
    network_id: String,
    /// Re-reads allowed after losing a compare-and-set race.
    max_retries: u32,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>, network_id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            store,
            network_id: network_id.into(),
            max_retries,
        }
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Read the current head record.
    pub async fn load(&self) -> Result<Option<StateRecord>> {
        self.store.current_state(&self.network_id).await
    }

    /// Compare-and-set from `previous` to `next`.
    pub async fn advance(
        &self,
        previous: Option<&StateRecord>,
        next: &BlockRef,
    ) -> Result<StateRecord> {
        self.store
            .advance_state(&self.network_id, previous, next)
            .await
    }

    /// Move the head to `added` if it should move, re-reading on lost races.
    ///
    /// The head never moves to a lower height. After `max_retries` lost races
    /// the work is treated as superseded by the winning writer and the record
    /// it left is returned as [`HeadUpdate::Superseded`].
    pub async fn reconcile_head(&self, added: &BlockRef) -> Result<HeadUpdate> {
        let mut attempt = 0u32;
        loop {
            let current = self.load().await?;
            let decision = head_decision(current.as_ref(), added);
            debug!(
                network = %self.network_id,
                hash = %added.hash,
                number = %added.number,
                ?decision,
                "head decision"
            );

            match (decision, current) {
                (HeadDecision::Unchanged, Some(head)) => return Ok(HeadUpdate::Unchanged(head)),
                (HeadDecision::Stale, Some(head)) => return Ok(HeadUpdate::Stale(head)),
                (_, current) => match self.advance(current.as_ref(), added).await {
                    Ok(written) => {
                        info!(
                            network = %self.network_id,
                            hash = %written.block_hash,
                            number = %written.block_number,
                            "state advanced"
                        );
                        return Ok(match current {
                            None => HeadUpdate::Created(written),
                            Some(previous) => HeadUpdate::Advanced {
                                previous,
                                current: written,
                            },
                        });
                    }
                    Err(e) if e.is_concurrent_update() && attempt < self.max_retries => {
                        attempt += 1;
                        debug!(
                            network = %self.network_id,
                            attempt,
                            "state advanced by another writer, re-reading"
                        );
                    }
                    Err(e) if e.is_concurrent_update() => {
                        // A record must exist for a compare-and-set to have lost
                        let Some(winner) = self.load().await? else {
                            return Err(e);
                        };
                        info!(
                            network = %self.network_id,
                            hash = %added.hash,
                            head = %winner.block_hash,
                            attempts = attempt + 1,
                            "state update superseded by another writer"
                        );
                        return Ok(HeadUpdate::Superseded(winner));
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory state store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, StateRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn current_state(&self, network_id: &str) -> Result<Option<StateRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(network_id).cloned())
    }

    async fn advance_state(
        &self,
        network_id: &str,
        previous: Option<&StateRecord>,
        next: &BlockRef,
    ) -> Result<StateRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = previous {
            let matches = records
                .get(network_id)
                .is_some_and(|stored| stored.same_head(previous));
            if !matches {
                return Err(BlockstreamError::ConcurrentUpdate {
                    network_id: network_id.to_string(),
                });
            }
        }

        let record = StateRecord {
            network_id: network_id.to_string(),
            block_hash: next.hash.clone(),
            block_number: next.number,
            timestamp: now_millis(),
        };
        records.insert(network_id.to_string(), record.clone());
        Ok(record)
    }
}
