//! blockstream-core: reorg-aware head tracking for an append-only block feed.
//!
//! # Architecture
//!
//! ```text
//! change feed → NotificationConsumer → MessageQueue
//!                                          │
//!                                     DrainWorker
//!                                          ├── BlockQuery   (all blocks at a height)
//!                                          ├── reconcile    (added / removed split)
//!                                          ├── StateManager (compare-and-set head record)
//!                                          └── LogSink      (added / retracted log fan-out)
//! ```

pub mod config;
pub mod consumer;
pub mod drain;
pub mod error;
pub mod fanout;
pub mod feed;
pub mod number;
pub mod query;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod state;
pub mod types;

pub use config::DrainConfig;
pub use consumer::{BatchReport, NotificationConsumer};
pub use drain::{DrainStats, DrainWorker, MessageOutcome};
pub use error::{BlockstreamError, Result};
pub use fanout::{
    emit_reconciliation, FanOutSummary, LogEvent, LogEventKind, LogSink, MemoryLogSink,
    QueueLogSink,
};
pub use feed::{extract_block_keys, parse_batch, BlockKey, FeedDecodeError, FeedEvent, FeedRecord};
pub use number::BlockNumber;
pub use query::BlockQuery;
pub use queue::{MemoryQueue, Message, MessageQueue};
pub use reconcile::{head_decision, reconcile, HeadDecision, ReconcileError, Reconciliation};
pub use retry::{RetryConfig, RetryPolicy};
pub use state::{HeadUpdate, MemoryStateStore, StateManager, StateStore};
pub use types::{BlockRecord, BlockRef, LogRecord, QueueMessage, StateRecord};
