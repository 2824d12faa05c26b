//! Durable SQLite queue with visibility timeouts.
//!
//! Several named queues share one database (the worker's block queue and log
//! queue typically live next to the state record). A received message is
//! hidden until its visibility deadline passes; acknowledging its current
//! receipt handle removes it for good.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use blockstream_core::error::{BlockstreamError, Result};
use blockstream_core::queue::{Message, MessageQueue};
use blockstream_core::state::now_millis;

use crate::sqlite::SqliteStorage;

fn queue_err(e: sqlx::Error) -> BlockstreamError {
    BlockstreamError::Queue(e.to_string())
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 80
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// One named queue inside a SQLite database.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    name: String,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    /// Open the queue `name` on an existing storage, creating its tables on
    /// first use.
    pub async fn open(
        storage: &SqliteStorage,
        name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self> {
        if !valid_name(name) {
            return Err(BlockstreamError::Config(format!("invalid queue name '{name}'")));
        }

        let queue = Self {
            pool: storage.pool().clone(),
            name: name.to_string(),
            visibility_timeout,
        };
        queue.init_schema().await?;
        Ok(queue)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                id             TEXT    NOT NULL PRIMARY KEY,
                queue          TEXT    NOT NULL,
                body           TEXT,
                receipt_handle TEXT,
                receive_count  INTEGER NOT NULL DEFAULT 0,
                last_received  INTEGER NOT NULL DEFAULT 0,
                visible_at     INTEGER NOT NULL,
                enqueued_at    INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_messages (queue, visible_at);",
        )
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id               TEXT    NOT NULL PRIMARY KEY,
                queue            TEXT    NOT NULL,
                body             TEXT,
                receive_count    INTEGER NOT NULL,
                dead_lettered_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages still in the queue, visible or not.
    pub async fn len(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM queue_messages WHERE queue = ?")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(queue_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Bodies of every queued message in enqueue order.
    pub async fn bodies(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT body FROM queue_messages WHERE queue = ? AND body IS NOT NULL ORDER BY rowid",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(rows.into_iter().map(|r| r.get("body")).collect())
    }

    pub async fn dead_letter_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM dead_letters WHERE queue = ?")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(queue_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn receive(&self, max_messages: usize) -> Result<Vec<Message>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let now = now_millis();
        let visible_at = now + self.visibility_timeout.as_millis() as i64;

        // Claimed in a single write statement; no read-then-upgrade.
        // Least recently received first.
        let rows = sqlx::query(
            "UPDATE queue_messages
             SET receipt_handle = lower(hex(randomblob(16))),
                 visible_at     = ?,
                 receive_count  = receive_count + 1,
                 last_received  = (SELECT COALESCE(MAX(last_received), 0) + 1 FROM queue_messages)
             WHERE id IN (
                 SELECT id FROM queue_messages
                 WHERE queue = ? AND visible_at <= ?
                 ORDER BY last_received, rowid
                 LIMIT ?
             )
             RETURNING rowid AS seq, id, body, receipt_handle, receive_count",
        )
        .bind(visible_at)
        .bind(&self.name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)?;

        let mut claimed: Vec<(i64, Message)> = rows
            .into_iter()
            .map(|row| {
                let receive_count: i64 = row.get("receive_count");
                (
                    row.get("seq"),
                    Message {
                        id: row.get("id"),
                        body: row.get("body"),
                        receipt_handle: row.get("receipt_handle"),
                        receive_count: receive_count as u32,
                    },
                )
            })
            .collect();
        // RETURNING order is unspecified
        claimed.sort_by_key(|(seq, _)| *seq);

        let batch: Vec<Message> = claimed.into_iter().map(|(_, m)| m).collect();
        if !batch.is_empty() {
            debug!(queue = %self.name, count = batch.len(), "messages received");
        }
        Ok(batch)
    }

    async fn acknowledge(&self, receipt_handle: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE queue = ? AND receipt_handle = ?")
            .bind(&self.name)
            .bind(receipt_handle)
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn send(&self, body: String) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            "INSERT INTO queue_messages (id, queue, body, receive_count, visible_at, enqueued_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&self.name)
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(())
    }

    async fn dead_letter(&self, message: &Message) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(queue_err)?;

        sqlx::query(
            "INSERT OR REPLACE INTO dead_letters (id, queue, body, receive_count, dead_lettered_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&self.name)
        .bind(message.body.as_deref())
        .bind(message.receive_count as i64)
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .map_err(queue_err)?;

        sqlx::query("DELETE FROM queue_messages WHERE queue = ? AND id = ?")
            .bind(&self.name)
            .bind(&message.id)
            .execute(&mut *tx)
            .await
            .map_err(queue_err)?;

        tx.commit().await.map_err(queue_err)?;
        debug!(queue = %self.name, id = %message.id, "message dead-lettered");
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
