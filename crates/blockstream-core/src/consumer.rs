//! Notification consumer: turns change-feed batches into block-queue
//! messages. It never waits on reconciliation.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::error::{BlockstreamError, Result};
use crate::feed::{extract_block_keys, FeedRecord};
use crate::queue::MessageQueue;
use crate::types::QueueMessage;

/// What happened to one notification batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Records in the batch.
    pub records: usize,
    /// Well-formed insertions found.
    pub extracted: usize,
    /// Messages enqueued.
    pub sent: usize,
}

/// Forwards block insertions from the change feed to the block queue.
pub struct NotificationConsumer {
    queue: Arc<dyn MessageQueue>,
}

impl NotificationConsumer {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue one [`QueueMessage`] per insertion in `records`.
    ///
    /// Every send is attempted. If any failed the batch is reported as a
    /// [`BlockstreamError::Queue`] error so the feed redelivers it; the
    /// duplicates this produces are harmless because reconciliation is
    /// idempotent.
    pub async fn handle_batch(&self, records: &[FeedRecord]) -> Result<BatchReport> {
        let keys = extract_block_keys(records);
        info!(
            records = records.len(),
            blocks = ?keys.iter().map(|k| (k.hash.as_str(), k.number.to_string())).collect::<Vec<_>>(),
            "received notification of block insertion"
        );

        let sends = keys.iter().map(|key| {
            let body = QueueMessage::from(key.clone()).to_json();
            self.queue.send(body)
        });
        let results = join_all(sends).await;

        let mut report = BatchReport {
            records: records.len(),
            extracted: keys.len(),
            sent: 0,
        };
        let mut failures = Vec::new();
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!(hash = %key.hash, number = %key.number, error = %e, "failed to enqueue block");
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(BlockstreamError::Queue(format!(
                "{} of {} block messages not enqueued: {}",
                failures.len(),
                report.extracted,
                failures.join("; ")
            )))
        }
    }
}
