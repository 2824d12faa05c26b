//! Log fan-out: one downstream event per log entry of a reconciled height.
//!
//! Delivery is not exactly-once: a redelivered message, or two workers racing
//! on the same height, may emit the same events twice. Consumers must
//! tolerate duplicates.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BlockstreamError, Result};
use crate::queue::MessageQueue;
use crate::reconcile::Reconciliation;
use crate::types::{BlockRecord, BlockRef, LogRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    /// The log belongs to the canonical block at its height.
    Added,
    /// The log belonged to a block that has been orphaned.
    Retracted,
}

/// A single fan-out event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub kind: LogEventKind,
    /// Block the log was produced in.
    pub block: BlockRef,
    /// Position of the log within its block's log list.
    pub log_index: usize,
    pub log: LogRecord,
}

impl LogEvent {
    fn for_block(kind: LogEventKind, record: &BlockRecord) -> impl Iterator<Item = LogEvent> + '_ {
        record.logs.iter().enumerate().map(move |(log_index, log)| LogEvent {
            kind,
            block: record.block.clone(),
            log_index,
            log: log.clone(),
        })
    }
}

/// Destination for fan-out events.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn emit(&self, event: LogEvent) -> Result<()>;
}

/// Counts of events emitted for one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutSummary {
    pub retracted: usize,
    pub added: usize,
}

/// Emit retractions for every orphaned block, then additions for the
/// canonical one. Stops at the first failed emission.
pub async fn emit_reconciliation(
    sink: &dyn LogSink,
    reconciliation: &Reconciliation,
) -> Result<FanOutSummary> {
    let mut summary = FanOutSummary::default();

    for record in &reconciliation.removed {
        for event in LogEvent::for_block(LogEventKind::Retracted, record) {
            sink.emit(event).await?;
            summary.retracted += 1;
        }
    }
    for event in LogEvent::for_block(LogEventKind::Added, &reconciliation.added) {
        sink.emit(event).await?;
        summary.added += 1;
    }

    Ok(summary)
}

// ─── Queue-backed sink ────────────────────────────────────────────────────────

/// Enqueues each event as a JSON message on a queue.
pub struct QueueLogSink {
    queue: Arc<dyn MessageQueue>,
}

impl QueueLogSink {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl LogSink for QueueLogSink {
    async fn emit(&self, event: LogEvent) -> Result<()> {
        let body =
            serde_json::to_string(&event).map_err(|e| BlockstreamError::FanOut(e.to_string()))?;
        self.queue
            .send(body)
            .await
            .map_err(|e| BlockstreamError::FanOut(e.to_string()))
    }
}

// ─── In-memory sink (for testing) ─────────────────────────────────────────────

/// Records emitted events in memory.
#[derive(Default)]
pub struct MemoryLogSink {
    events: Mutex<Vec<LogEvent>>,
    failing: AtomicU32,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` emissions fail.
    pub fn fail_next(&self, n: u32) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: LogEventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn emit(&self, event: LogEvent) -> Result<()> {
        if self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BlockstreamError::FanOut("sink rejected event".into()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}
