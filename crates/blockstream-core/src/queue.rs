//! Durable queue transport seen by the drain worker and the notification
//! consumer.
//!
//! Delivery is at-least-once: a received message stays invisible to other
//! consumers for a visibility window and reappears if it is not acknowledged
//! in time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{BlockstreamError, Result};

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub body: Option<String>,
    /// Handle for this delivery; changes on every redelivery.
    pub receipt_handle: Option<String>,
    /// How many times the message has been delivered, this delivery included.
    pub receive_count: u32,
}

/// Queue operations the core depends on.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receive up to `max_messages` currently visible messages. An empty
    /// batch means nothing is available right now.
    async fn receive(&self, max_messages: usize) -> Result<Vec<Message>>;

    /// Remove a delivered message. Acknowledging an unknown or already
    /// removed handle succeeds.
    async fn acknowledge(&self, receipt_handle: &str) -> Result<()>;

    /// Enqueue a new message body.
    async fn send(&self, body: String) -> Result<()>;

    /// Move a delivered message out of the queue into its dead-letter store.
    async fn dead_letter(&self, message: &Message) -> Result<()>;
}

// ─── In-memory queue ──────────────────────────────────────────────────────────

struct Entry {
    id: String,
    body: Option<String>,
    /// Deliver without a receipt handle (simulates a broken transport).
    omit_handle: bool,
    handle: Option<String>,
    visible_at: Instant,
    receive_count: u32,
}

#[derive(Default)]
struct MemoryQueueInner {
    entries: VecDeque<Entry>,
    dead_letters: Vec<Message>,
}

/// In-memory queue with visibility timeouts, for tests and single-process use.
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
    visibility_timeout: Duration,
    failing_acks: AtomicU32,
    failing_sends: AtomicU32,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(MemoryQueueInner::default()),
            visibility_timeout,
            failing_acks: AtomicU32::new(0),
            failing_sends: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryQueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a message exactly as given, optionally without a body or
    /// without receipt handles on delivery. Returns the message id.
    pub fn push_raw(&self, body: Option<String>, with_handle: bool) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.lock().entries.push_back(Entry {
            id: id.clone(),
            body,
            omit_handle: !with_handle,
            handle: None,
            visible_at: Instant::now(),
            receive_count: 0,
        });
        id
    }

    /// Make the next `n` acknowledgements fail with a queue error.
    pub fn fail_next_acks(&self, n: u32) {
        self.failing_acks.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` sends fail with a queue error.
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Messages still in the queue, visible or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of all messages still in the queue, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .filter_map(|e| e.body.clone())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<Message> {
        self.lock().dead_letters.clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn receive(&self, max_messages: usize) -> Result<Vec<Message>> {
        let now = Instant::now();
        let visibility = self.visibility_timeout;
        let mut inner = self.lock();

        // Least recently received first: received entries move to the back.
        let mut picked = Vec::new();
        let mut rest = VecDeque::with_capacity(inner.entries.len());
        for entry in inner.entries.drain(..) {
            if picked.len() < max_messages && entry.visible_at <= now {
                picked.push(entry);
            } else {
                rest.push_back(entry);
            }
        }

        let batch: Vec<Message> = picked
            .iter_mut()
            .map(|e| {
                e.receive_count += 1;
                e.visible_at = now + visibility;
                e.handle = (!e.omit_handle).then(|| uuid::Uuid::new_v4().to_string());
                Message {
                    id: e.id.clone(),
                    body: e.body.clone(),
                    receipt_handle: e.handle.clone(),
                    receive_count: e.receive_count,
                }
            })
            .collect();

        rest.extend(picked);
        inner.entries = rest;
        Ok(batch)
    }

    async fn acknowledge(&self, receipt_handle: &str) -> Result<()> {
        if Self::take_failure(&self.failing_acks) {
            return Err(BlockstreamError::Queue("acknowledge failed".into()));
        }
        self.lock()
            .entries
            .retain(|e| e.handle.as_deref() != Some(receipt_handle));
        Ok(())
    }

    async fn send(&self, body: String) -> Result<()> {
        if Self::take_failure(&self.failing_sends) {
            return Err(BlockstreamError::Queue("send failed".into()));
        }
        self.push_raw(Some(body), true);
        Ok(())
    }

    async fn dead_letter(&self, message: &Message) -> Result<()> {
        let mut inner = self.lock();
        inner.entries.retain(|e| e.id != message.id);
        inner.dead_letters.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn received_messages_are_hidden_until_timeout() {
        let queue = MemoryQueue::new(Duration::from_millis(50));
        queue.send("a".into()).await.unwrap();

        let first = queue.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.receive(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = queue.receive(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test]
    async fn acknowledge_removes_and_is_idempotent() {
        let queue = MemoryQueue::default();
        queue.send("a".into()).await.unwrap();
        let msg = queue.receive(1).await.unwrap().remove(0);
        let handle = msg.receipt_handle.unwrap();

        queue.acknowledge(&handle).await.unwrap();
        queue.acknowledge(&handle).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn batch_size_is_respected() {
        let queue = MemoryQueue::default();
        for i in 0..5 {
            queue.send(format!("m{i}")).await.unwrap();
        }
        assert_eq!(queue.receive(3).await.unwrap().len(), 3);
        assert_eq!(queue.receive(3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn redelivered_messages_go_behind_waiting_ones() {
        let queue = MemoryQueue::new(Duration::ZERO);
        queue.send("a".into()).await.unwrap();
        queue.send("b".into()).await.unwrap();

        let first = queue.receive(1).await.unwrap();
        let second = queue.receive(1).await.unwrap();
        let third = queue.receive(1).await.unwrap();
        assert_eq!(first[0].body.as_deref(), Some("a"));
        assert_eq!(second[0].body.as_deref(), Some("b"));
        assert_eq!(third[0].body.as_deref(), Some("a"));
        assert_eq!(third[0].receive_count, 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let queue = MemoryQueue::default();
        queue.fail_next_sends(1);
        assert!(queue.send("a".into()).await.is_err());
        assert!(queue.send("a".into()).await.is_ok());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn dead_letter_moves_message() {
        let queue = MemoryQueue::default();
        queue.send("poison".into()).await.unwrap();
        let msg = queue.receive(1).await.unwrap().remove(0);
        queue.dead_letter(&msg).await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters()[0].body.as_deref(), Some("poison"));
    }
}
