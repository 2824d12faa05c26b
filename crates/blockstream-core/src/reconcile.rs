//! Reorg reconciliation.
//!
//! The hash asserted by an incoming notification is taken as canonical for its
//! height. Every other record previously observed at that height is orphaned
//! and its logs are retracted. No chain walk is attempted: the work is linear
//! in the number of records at the height.

use thiserror::Error;

use crate::number::BlockNumber;
use crate::types::{BlockRecord, BlockRef, StateRecord};

/// Precondition failures of [`reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("Reconciliation error: no blocks at height {number}")]
    NoBlocksAtHeight { number: BlockNumber },

    #[error("Reconciliation error: asserted block {hash} not present at height {number}")]
    AssertedBlockMissing { hash: String, number: BlockNumber },
}

/// Outcome of reconciling one height.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Competing records that are now orphaned, in query order.
    pub removed: Vec<BlockRecord>,
    /// The record matching the asserted hash.
    pub added: BlockRecord,
}

impl Reconciliation {
    /// Returns `true` if at least one competing block was orphaned.
    pub fn is_reorg(&self) -> bool {
        !self.removed.is_empty()
    }

    /// Number of logs that will be retracted.
    pub fn retracted_log_count(&self) -> usize {
        self.removed.iter().map(|r| r.logs.len()).sum()
    }

    /// Number of logs that will be announced.
    pub fn added_log_count(&self) -> usize {
        self.added.logs.len()
    }
}

/// Split the records at a height into the asserted block and the orphans.
///
/// Pure and deterministic: the same input always yields the same output.
pub fn reconcile(
    matching_blocks: &[BlockRecord],
    asserted: &BlockRef,
) -> Result<Reconciliation, ReconcileError> {
    if matching_blocks.is_empty() {
        return Err(ReconcileError::NoBlocksAtHeight {
            number: asserted.number,
        });
    }

    let added = matching_blocks
        .iter()
        .find(|r| r.hash() == asserted.hash)
        .cloned()
        .ok_or_else(|| ReconcileError::AssertedBlockMissing {
            hash: asserted.hash.clone(),
            number: asserted.number,
        })?;

    let removed = matching_blocks
        .iter()
        .filter(|r| r.hash() != asserted.hash)
        .cloned()
        .collect();

    Ok(Reconciliation { removed, added })
}

/// What should happen to the persisted head after reconciling `added`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadDecision {
    /// No state recorded yet for the network.
    Create,
    /// `added` is higher than the head, or replaces it at the same height.
    Advance,
    /// The head already points at `added`.
    Unchanged,
    /// `added` is below the head; writing it would move the head backwards.
    Stale,
}

impl HeadDecision {
    pub fn writes(&self) -> bool {
        matches!(self, Self::Create | Self::Advance)
    }
}

/// Decide whether the state record needs advancing to `added`.
pub fn head_decision(current: Option<&StateRecord>, added: &BlockRef) -> HeadDecision {
    let Some(current) = current else {
        return HeadDecision::Create;
    };
    match added.number.cmp(&current.block_number) {
        std::cmp::Ordering::Greater => HeadDecision::Advance,
        std::cmp::Ordering::Less => HeadDecision::Stale,
        std::cmp::Ordering::Equal if added.hash == current.block_hash => HeadDecision::Unchanged,
        std::cmp::Ordering::Equal => HeadDecision::Advance,
    }
}
