//! The drain worker: pulls block messages off the queue, reconciles the
//! height, fans out log changes, and only then acknowledges.
//!
//! Per message:
//! ```text
//! Received → Parsed → Reconciled → FannedOut → Acknowledged
//!     └──────────┴──────────┴───────────┴──→ Failed (left for redelivery)
//! ```
//!
//! A failure is confined to its message. Nothing short of cancellation stops
//! the poll loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DrainConfig;
use crate::error::{BlockstreamError, Result};
use crate::fanout::{emit_reconciliation, FanOutSummary, LogSink};
use crate::query::BlockQuery;
use crate::queue::{Message, MessageQueue};
use crate::reconcile::reconcile;
use crate::retry::RetryPolicy;
use crate::state::{HeadUpdate, StateManager, StateStore};
use crate::types::{BlockRef, QueueMessage};

/// Consecutive batches of already-processed messages after which
/// [`DrainWorker::drain`] stops.
pub const MAX_SEEN_ONLY_BATCHES: u32 = 2;

/// How a message left the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Reconciled, fanned out, and removed from the queue.
    Acknowledged {
        block: BlockRef,
        head: HeadUpdate,
        fan_out: FanOutSummary,
    },
    /// Delivered more often than `max_receive_count`; moved aside unprocessed.
    DeadLettered { receive_count: u32 },
}

/// Counters for one drain pass or one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub received: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub malformed: u64,
    pub dead_lettered: u64,
    pub logs_added: u64,
    pub logs_retracted: u64,
}

impl DrainStats {
    fn record(&mut self, outcome: &Result<MessageOutcome>) {
        self.received += 1;
        match outcome {
            Ok(MessageOutcome::Acknowledged { fan_out, .. }) => {
                self.acknowledged += 1;
                self.logs_added += fan_out.added as u64;
                self.logs_retracted += fan_out.retracted as u64;
            }
            Ok(MessageOutcome::DeadLettered { .. }) => self.dead_lettered += 1,
            Err(BlockstreamError::MalformedMessage { .. }) => self.malformed += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Long-running consumer of the block queue.
pub struct DrainWorker {
    config: DrainConfig,
    queue: Arc<dyn MessageQueue>,
    blocks: Arc<dyn BlockQuery>,
    state: StateManager,
    sink: Arc<dyn LogSink>,
    ack_retry: RetryPolicy,
}

impl DrainWorker {
    pub fn new(
        config: DrainConfig,
        queue: Arc<dyn MessageQueue>,
        blocks: Arc<dyn BlockQuery>,
        state_store: Arc<dyn StateStore>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let state = StateManager::new(
            state_store,
            config.network_id.clone(),
            config.max_state_retries,
        );
        Self {
            ack_retry: RetryPolicy::new(config.ack_retry.clone()),
            config,
            queue,
            blocks,
            state,
            sink,
        }
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Process a single delivery. On `Err` the message has not been
    /// acknowledged and will be redelivered by the queue.
    pub async fn process_message(&self, message: &Message) -> Result<MessageOutcome> {
        let handle = message.receipt_handle.as_deref().filter(|h| !h.is_empty());

        // Bounded before validation so a malformed body is not redelivered
        // forever.
        if let (Some(max), Some(_)) = (self.config.max_receive_count, handle) {
            if message.receive_count > max {
                warn!(
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    max,
                    "delivery limit exceeded, dead-lettering message"
                );
                self.queue.dead_letter(message).await?;
                return Ok(MessageOutcome::DeadLettered {
                    receive_count: message.receive_count,
                });
            }
        }

        let (body, handle) = match (message.body.as_deref(), handle) {
            (Some(body), Some(handle)) if !body.trim().is_empty() => (body, handle),
            (body, handle) => {
                error!(
                    message_id = %message.id,
                    receipt_handle = ?handle,
                    body = ?body,
                    "message received with no body/receipt handle"
                );
                return Err(BlockstreamError::malformed(
                    Some(&message.id),
                    "missing body or receipt handle",
                ));
            }
        };

        debug!(message_id = %message.id, body, "processing message");

        let QueueMessage { hash, number } = QueueMessage::from_json(body)
            .map_err(|e| BlockstreamError::malformed(Some(&message.id), e.to_string()))?;
        let asserted = BlockRef { hash, number };
        info!(hash = %asserted.hash, number = %asserted.number, "processing block");

        let matching = self.blocks.blocks_matching_number(asserted.number).await?;
        let reconciliation = reconcile(&matching, &asserted)?;

        info!(
            removed = ?reconciliation
                .removed
                .iter()
                .map(|r| (r.hash(), r.logs.len()))
                .collect::<Vec<_>>(),
            added = %reconciliation.added.hash(),
            added_logs = reconciliation.added_log_count(),
            "processing block changes"
        );

        let head = self.state.reconcile_head(&reconciliation.added.block).await?;
        if let HeadUpdate::Stale(current) = &head {
            debug!(
                number = %asserted.number,
                head = %current.block_number,
                "reconciled height is below the head, state left as is"
            );
        }

        let fan_out = emit_reconciliation(self.sink.as_ref(), &reconciliation).await?;

        self.ack_retry
            .retry(|| self.queue.acknowledge(handle))
            .await?;

        Ok(MessageOutcome::Acknowledged {
            block: asserted,
            head,
            fan_out,
        })
    }

    /// Drain the queue until it returns an empty batch, then return.
    ///
    /// A message redelivered within the same pass is not processed again.
    /// Batches made up only of such redeliveries are skipped, and after
    /// [`MAX_SEEN_ONLY_BATCHES`] of them in a row the pass ends. Only a
    /// failure to receive aborts the pass.
    pub async fn drain(&self) -> Result<DrainStats> {
        let mut stats = DrainStats::default();
        let mut seen = HashSet::new();
        let mut seen_only = 0u32;

        loop {
            let batch = self.queue.receive(self.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let fresh: Vec<Message> = batch
                .into_iter()
                .filter(|m| seen.insert(m.id.clone()))
                .collect();
            if fresh.is_empty() {
                seen_only += 1;
                if seen_only >= MAX_SEEN_ONLY_BATCHES {
                    debug!(batches = seen_only, "only redeliveries left, ending pass");
                    break;
                }
                continue;
            }

            seen_only = 0;
            self.process_batch(fresh, &mut stats, None).await;
        }

        info!(?stats, "queue drained");
        Ok(stats)
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// Cancellation stops polling. The message in progress is finished; the
    /// rest of its batch is left for redelivery.
    pub async fn run(&self, shutdown: CancellationToken) -> DrainStats {
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        let mut stats = DrainStats::default();

        info!(
            network = %self.config.network_id,
            batch_size = self.config.batch_size,
            "drain worker started"
        );

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                batch = self.queue.receive(self.config.batch_size) => batch,
            };

            match batch {
                Ok(batch) if !batch.is_empty() => {
                    self.process_batch(batch, &mut stats, Some(&shutdown)).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to receive messages"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        info!(?stats, "drain worker stopped");
        stats
    }

    async fn process_batch(
        &self,
        batch: Vec<Message>,
        stats: &mut DrainStats,
        shutdown: Option<&CancellationToken>,
    ) {
        let total = batch.len();
        for (i, message) in batch.iter().enumerate() {
            if shutdown.is_some_and(CancellationToken::is_cancelled) {
                info!(remaining = total - i, "shutdown requested, leaving messages for redelivery");
                break;
            }

            let outcome = self.process_message(message).await;
            match &outcome {
                Ok(_) => {}
                Err(e @ BlockstreamError::MalformedMessage { .. }) => {
                    error!(message_id = %message.id, error = %e, "malformed message left on queue");
                }
                Err(e @ BlockstreamError::Reconciliation(_)) => {
                    error!(message_id = %message.id, error = %e, "reconciliation failed");
                }
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        retryable = e.is_retryable(),
                        error = %e,
                        "message processing failed"
                    );
                }
            }
            stats.record(&outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{LogEventKind, MemoryLogSink};
    use crate::number::BlockNumber;
    use crate::queue::MemoryQueue;
    use crate::reconcile::ReconcileError;
    use crate::retry::RetryConfig;
    use crate::state::MemoryStateStore;
    use crate::types::{BlockRecord, StateRecord};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeBlocks {
        by_number: HashMap<BlockNumber, Vec<BlockRecord>>,
        unavailable: bool,
    }

    impl FakeBlocks {
        fn with(records: Vec<BlockRecord>) -> Self {
            let mut by_number: HashMap<BlockNumber, Vec<BlockRecord>> = HashMap::new();
            for r in records {
                by_number.entry(r.number()).or_default().push(r);
            }
            Self {
                by_number,
                unavailable: false,
            }
        }
    }

    #[async_trait]
    impl BlockQuery for FakeBlocks {
        async fn blocks_matching_number(&self, number: BlockNumber) -> Result<Vec<BlockRecord>> {
            if self.unavailable {
                return Err(BlockstreamError::StoreUnavailable("blocks offline".into()));
            }
            Ok(self.by_number.get(&number).cloned().unwrap_or_default())
        }
    }

    struct Harness {
        worker: DrainWorker,
        queue: Arc<MemoryQueue>,
        sink: Arc<MemoryLogSink>,
        state: Arc<MemoryStateStore>,
    }

    fn harness_with(blocks: FakeBlocks, queue: MemoryQueue, config: DrainConfig) -> Harness {
        let queue = Arc::new(queue);
        let sink = Arc::new(MemoryLogSink::new());
        let state = Arc::new(MemoryStateStore::new());
        let worker = DrainWorker::new(
            config,
            queue.clone(),
            Arc::new(blocks),
            state.clone(),
            sink.clone(),
        );
        Harness {
            worker,
            queue,
            sink,
            state,
        }
    }

    fn fast_config() -> DrainConfig {
        DrainConfig {
            poll_interval_ms: 5,
            ack_retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    fn harness(blocks: FakeBlocks) -> Harness {
        harness_with(blocks, MemoryQueue::default(), fast_config())
    }

    fn rec(hash: &str, number: u64, logs: &[&str]) -> BlockRecord {
        BlockRecord::new(
            BlockRef::new(hash, number),
            logs.iter().map(|l| json!(l)).collect(),
        )
    }

    fn fork_at_five() -> FakeBlocks {
        FakeBlocks::with(vec![
            rec("0xA", 5, &["l1", "l2"]),
            rec("0xB", 5, &["l3"]),
            rec("0xC", 7, &["l4"]),
        ])
    }

    async fn enqueue(queue: &MemoryQueue, hash: &str, number: u64) {
        queue
            .send(QueueMessage::from(BlockRef::new(hash, number)).to_json())
            .await
            .unwrap();
    }

    async fn state_of(h: &Harness) -> Option<StateRecord> {
        h.state.current_state("mainnet").await.unwrap()
    }

    #[tokio::test]
    async fn fork_retracts_and_adds() {
        let h = harness(fork_at_five());
        enqueue(&h.queue, "0xB", 5).await;

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.logs_retracted, 2);
        assert_eq!(stats.logs_added, 1);

        assert_eq!(h.sink.count(LogEventKind::Retracted), 2);
        assert_eq!(h.sink.count(LogEventKind::Added), 1);
        let retracted: Vec<_> = h
            .sink
            .events()
            .into_iter()
            .filter(|e| e.kind == LogEventKind::Retracted)
            .map(|e| e.log)
            .collect();
        assert_eq!(retracted, vec![json!("l1"), json!("l2")]);

        assert!(h.queue.is_empty());
        assert_eq!(state_of(&h).await.unwrap().block_hash, "0xB");
    }

    #[tokio::test]
    async fn no_fork_only_adds() {
        let h = harness(fork_at_five());
        enqueue(&h.queue, "0xC", 7).await;

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(h.sink.count(LogEventKind::Retracted), 0);
        assert_eq!(h.sink.count(LogEventKind::Added), 1);
        assert_eq!(state_of(&h).await.unwrap().block_number, 7u64.into());
    }

    #[tokio::test]
    async fn empty_body_is_never_acknowledged_or_reconciled() {
        let h = harness(fork_at_five());
        h.queue.push_raw(Some(String::new()), true);
        h.queue.push_raw(None, true);
        h.queue.push_raw(Some(r#"{"hash":"0xB","number":5}"#.into()), false);

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.malformed, 3);
        assert_eq!(stats.acknowledged, 0);
        assert_eq!(h.queue.len(), 3);
        assert!(h.sink.events().is_empty());
        assert!(state_of(&h).await.is_none());
    }

    #[tokio::test]
    async fn unparseable_body_is_malformed() {
        let h = harness(fork_at_five());
        h.queue.send("{not json".into()).await.unwrap();
        let msg = h.queue.receive(1).await.unwrap().remove(0);

        let err = h.worker.process_message(&msg).await.unwrap_err();
        assert!(matches!(err, BlockstreamError::MalformedMessage { .. }));
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn unknown_height_or_hash_fails_the_message() {
        let h = harness(fork_at_five());
        enqueue(&h.queue, "0xZ", 5).await;
        enqueue(&h.queue, "0xA", 99).await;

        let mut results = Vec::new();
        for msg in h.queue.receive(10).await.unwrap() {
            results.push(h.worker.process_message(&msg).await);
        }

        assert!(matches!(
            results[0],
            Err(BlockstreamError::Reconciliation(
                ReconcileError::AssertedBlockMissing { .. }
            ))
        ));
        assert!(matches!(
            results[1],
            Err(BlockstreamError::Reconciliation(
                ReconcileError::NoBlocksAtHeight { .. }
            ))
        ));
        assert_eq!(h.queue.len(), 2);
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn one_bad_message_does_not_block_the_rest() {
        let h = harness(fork_at_five());
        h.queue.push_raw(None, true);
        enqueue(&h.queue, "0xZ", 5).await;
        enqueue(&h.queue, "0xC", 7).await;

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(h.queue.len(), 2);
    }

    #[tokio::test]
    async fn fan_out_failure_leaves_message_for_redelivery() {
        let h = harness_with(fork_at_five(), MemoryQueue::new(Duration::ZERO), fast_config());
        enqueue(&h.queue, "0xB", 5).await;
        h.sink.fail_next(1);

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(h.queue.len(), 1);

        // Redelivery succeeds; the state write from the first attempt is reused.
        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.acknowledged, 1);
        assert!(h.queue.is_empty());
        assert_eq!(h.sink.count(LogEventKind::Added), 1);
        assert_eq!(state_of(&h).await.unwrap().block_hash, "0xB");
    }

    #[tokio::test]
    async fn acknowledgement_is_retried() {
        let h = harness(fork_at_five());
        enqueue(&h.queue, "0xC", 7).await;
        h.queue.fail_next_acks(2);

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.acknowledged, 1);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn acknowledgement_gives_up_after_bound() {
        let h = harness(fork_at_five());
        enqueue(&h.queue, "0xC", 7).await;
        h.queue.fail_next_acks(10);

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(h.queue.len(), 1);
        // Fan-out already happened; a redelivery will repeat it.
        assert_eq!(h.sink.count(LogEventKind::Added), 1);
    }

    #[tokio::test]
    async fn poison_message_is_dead_lettered() {
        let config = DrainConfig {
            max_receive_count: Some(2),
            ..fast_config()
        };
        let visibility = Duration::from_millis(50);
        let h = harness_with(fork_at_five(), MemoryQueue::new(visibility), config);
        enqueue(&h.queue, "0xZ", 5).await;

        assert_eq!(h.worker.drain().await.unwrap().failed, 1);
        tokio::time::sleep(visibility * 2).await;
        assert_eq!(h.worker.drain().await.unwrap().failed, 1);
        tokio::time::sleep(visibility * 2).await;
        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);

        assert!(h.queue.is_empty());
        let dead = h.queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].receive_count, 3);
    }

    #[tokio::test]
    async fn storage_outage_is_isolated() {
        let blocks = FakeBlocks {
            unavailable: true,
            ..fork_at_five()
        };
        let h = harness(blocks);
        enqueue(&h.queue, "0xB", 5).await;

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn lower_height_fans_out_without_moving_head() {
        let h = harness(fork_at_five());
        enqueue(&h.queue, "0xC", 7).await;
        h.worker.drain().await.unwrap();

        enqueue(&h.queue, "0xA", 5).await;
        let msg = h.queue.receive(1).await.unwrap().remove(0);
        let outcome = h.worker.process_message(&msg).await.unwrap();
        match outcome {
            MessageOutcome::Acknowledged { head, fan_out, .. } => {
                assert!(matches!(head, HeadUpdate::Stale(_)));
                assert_eq!(fan_out, FanOutSummary { retracted: 1, added: 2 });
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(state_of(&h).await.unwrap().block_hash, "0xC");
    }

    #[tokio::test]
    async fn redelivered_message_is_idempotent_for_state() {
        let h = harness(fork_at_five());
        enqueue(&h.queue, "0xB", 5).await;
        enqueue(&h.queue, "0xB", 5).await;

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.acknowledged, 2);
        let head = state_of(&h).await.unwrap();
        assert_eq!(head.block_hash, "0xB");
        assert_eq!(head.block_number, 5u64.into());
    }

    #[tokio::test]
    async fn failing_head_of_queue_does_not_hide_later_messages() {
        let config = DrainConfig {
            batch_size: 1,
            ..fast_config()
        };
        let h = harness_with(fork_at_five(), MemoryQueue::new(Duration::ZERO), config);
        enqueue(&h.queue, "0xZ", 7).await;
        enqueue(&h.queue, "0xC", 7).await;

        let stats = h.worker.drain().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(h.queue.len(), 1);
        assert_eq!(state_of(&h).await.unwrap().block_hash, "0xC");
    }

    #[tokio::test]
    async fn malformed_body_is_dead_lettered_after_bound() {
        let config = DrainConfig {
            max_receive_count: Some(2),
            ..fast_config()
        };
        let h = harness_with(fork_at_five(), MemoryQueue::new(Duration::ZERO), config);
        h.queue.push_raw(Some(String::new()), true);

        let mut last = None;
        for _ in 0..3 {
            let msg = h.queue.receive(1).await.unwrap().remove(0);
            last = Some(h.worker.process_message(&msg).await);
        }

        assert!(matches!(
            last,
            Some(Ok(MessageOutcome::DeadLettered { receive_count: 3 }))
        ));
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.dead_letters().len(), 1);
    }

    /// Holds every query until released.
    struct GatedBlocks {
        inner: FakeBlocks,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BlockQuery for GatedBlocks {
        async fn blocks_matching_number(&self, number: BlockNumber) -> Result<Vec<BlockRecord>> {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.blocks_matching_number(number).await
        }
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_message() {
        let queue = Arc::new(MemoryQueue::default());
        let sink = Arc::new(MemoryLogSink::new());
        let blocks = Arc::new(GatedBlocks {
            inner: fork_at_five(),
            started: Notify::new(),
            release: Notify::new(),
        });
        let worker = DrainWorker::new(
            fast_config(),
            queue.clone(),
            blocks.clone(),
            Arc::new(MemoryStateStore::new()),
            sink.clone(),
        );

        enqueue(&queue, "0xB", 5).await;
        enqueue(&queue, "0xC", 7).await;

        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        // First message is mid-reconciliation when the signal arrives
        tokio::time::timeout(Duration::from_secs(5), blocks.started.notified())
            .await
            .unwrap();
        shutdown.cancel();
        blocks.release.notify_one();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.bodies(), vec![r#"{"hash":"0xC","number":7}"#.to_string()]);
        assert_eq!(sink.count(LogEventKind::Added), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let h = harness(fork_at_five());
        let worker = Arc::new(h.worker);
        let shutdown = CancellationToken::new();

        let handle = {
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        enqueue(&h.queue, "0xB", 5).await;
        enqueue(&h.queue, "0xC", 7).await;

        for _ in 0..200 {
            if h.queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.acknowledged, 2);
        assert!(h.queue.is_empty());
    }
}
