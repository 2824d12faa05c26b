//! Height query: every block record observed at a height.

use async_trait::async_trait;

use crate::error::Result;
use crate::number::BlockNumber;
use crate::types::BlockRecord;

/// Read access to stored block records.
///
/// Block storage is append-only; nothing in this crate mutates it.
#[async_trait]
pub trait BlockQuery: Send + Sync {
    /// Every record with height `number`, each with its full log list, in no
    /// particular order. Empty if the height was never observed.
    async fn blocks_matching_number(&self, number: BlockNumber) -> Result<Vec<BlockRecord>>;
}
