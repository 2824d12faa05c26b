//! SQLite storage backend for Blockstream.
//!
//! Persists the per-network state record and observed block records (with
//! their logs) to a single SQLite file. Heights are stored as canonical
//! decimal text so that comparisons stay exact beyond 64 bits.
//!
//! # Usage
//! ```rust,no_run
//! use blockstream_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./blockstream.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use blockstream_core::error::{BlockstreamError, Result};
use blockstream_core::number::BlockNumber;
use blockstream_core::query::BlockQuery;
use blockstream_core::state::{now_millis, StateStore};
use blockstream_core::types::{BlockRecord, BlockRef, StateRecord};

pub(crate) fn store_err(e: sqlx::Error) -> BlockstreamError {
    BlockstreamError::StoreUnavailable(e.to_string())
}

fn parse_number(text: &str) -> Result<BlockNumber> {
    text.parse()
        .map_err(|e| BlockstreamError::Other(format!("corrupt block number in store: {e}")))
}

/// SQLite-backed state record and block store.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./blockstream.db"`) or a full
    /// SQLite URL (`"sqlite:./blockstream.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(store_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(store_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to a single connection: every connection to `:memory:` is its
    /// own database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(store_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// The underlying pool, shared with [`SqliteQueue`](crate::queue::SqliteQueue).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        // One record per network
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blockstream_state (
                network_id   TEXT    NOT NULL PRIMARY KEY,
                block_hash   TEXT    NOT NULL,
                block_number TEXT    NOT NULL,
                timestamp    INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        // Every block ever observed; several may share a height
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_hash   TEXT    NOT NULL PRIMARY KEY,
                block_number TEXT    NOT NULL,
                inserted_at  INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blocks_number ON blocks (block_number);")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS block_logs (
                block_hash TEXT    NOT NULL,
                log_index  INTEGER NOT NULL,
                payload    TEXT    NOT NULL,
                PRIMARY KEY (block_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    // ─── Block storage ──────────────────────────────────────────────────────────

    /// Record an observed block and its logs.
    ///
    /// Block records are append-only: if the hash is already stored nothing
    /// is written and `false` is returned.
    pub async fn insert_block(&self, record: &BlockRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO blocks (block_hash, block_number, inserted_at)
             VALUES (?, ?, ?)",
        )
        .bind(record.hash())
        .bind(record.number().to_string())
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected()
            == 1;

        if !inserted {
            return Ok(false);
        }

        for (index, log) in record.logs.iter().enumerate() {
            let payload =
                serde_json::to_string(log).map_err(|e| BlockstreamError::Other(e.to_string()))?;
            sqlx::query(
                "INSERT INTO block_logs (block_hash, log_index, payload) VALUES (?, ?, ?)",
            )
            .bind(record.hash())
            .bind(index as i64)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        debug!(hash = %record.hash(), number = %record.number(), logs = record.logs.len(), "block stored");
        Ok(true)
    }

    /// Total number of stored block records.
    pub async fn block_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

#[async_trait]
impl BlockQuery for SqliteStorage {
    async fn blocks_matching_number(&self, number: BlockNumber) -> Result<Vec<BlockRecord>> {
        let rows = sqlx::query(
            "SELECT b.block_hash, b.block_number, l.payload
             FROM blocks b
             LEFT JOIN block_logs l ON l.block_hash = b.block_hash
             WHERE b.block_number = ?
             ORDER BY b.rowid, l.log_index",
        )
        .bind(number.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut records: Vec<BlockRecord> = Vec::new();
        for row in rows {
            let hash: String = row.get("block_hash");
            if records.last().map(|r| r.hash()) != Some(hash.as_str()) {
                let stored: String = row.get("block_number");
                let block = BlockRef {
                    hash: hash.clone(),
                    number: parse_number(&stored)?,
                };
                records.push(BlockRecord::new(block, Vec::new()));
            }

            let payload: Option<String> = row.get("payload");
            if let (Some(payload), Some(record)) = (payload, records.last_mut()) {
                let log = serde_json::from_str(&payload).map_err(|e| {
                    BlockstreamError::Other(format!("corrupt log payload for {hash}: {e}"))
                })?;
                record.logs.push(log);
            }
        }
        Ok(records)
    }
}

// ─── State record ─────────────────────────────────────────────────────────────

#[async_trait]
impl StateStore for SqliteStorage {
    async fn current_state(&self, network_id: &str) -> Result<Option<StateRecord>> {
        let row = sqlx::query(
            "SELECT network_id, block_hash, block_number, timestamp
             FROM blockstream_state WHERE network_id = ?",
        )
        .bind(network_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(|r| {
            let number: String = r.get("block_number");
            Ok(StateRecord {
                network_id: r.get("network_id"),
                block_hash: r.get("block_hash"),
                block_number: parse_number(&number)?,
                timestamp: r.get("timestamp"),
            })
        })
        .transpose()
    }

    async fn advance_state(
        &self,
        network_id: &str,
        previous: Option<&StateRecord>,
        next: &BlockRef,
    ) -> Result<StateRecord> {
        let record = StateRecord {
            network_id: network_id.to_string(),
            block_hash: next.hash.clone(),
            block_number: next.number,
            timestamp: now_millis(),
        };

        let affected = match previous {
            None => sqlx::query(
                "INSERT INTO blockstream_state (network_id, block_hash, block_number, timestamp)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(network_id) DO UPDATE SET
                    block_hash   = excluded.block_hash,
                    block_number = excluded.block_number,
                    timestamp    = excluded.timestamp",
            )
            .bind(&record.network_id)
            .bind(&record.block_hash)
            .bind(record.block_number.to_string())
            .bind(record.timestamp)
            .execute(&self.pool)
            .await
            .map_err(store_err)?
            .rows_affected(),

            Some(prev) if prev.network_id != network_id => 0,

            Some(prev) => sqlx::query(
                "UPDATE blockstream_state
                 SET block_hash = ?, block_number = ?, timestamp = ?
                 WHERE network_id = ? AND block_hash = ? AND block_number = ?",
            )
            .bind(&record.block_hash)
            .bind(record.block_number.to_string())
            .bind(record.timestamp)
            .bind(network_id)
            .bind(&prev.block_hash)
            .bind(prev.block_number.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_err)?
            .rows_affected(),
        };

        if affected == 0 {
            return Err(BlockstreamError::ConcurrentUpdate {
                network_id: network_id.to_string(),
            });
        }

        debug!(network = network_id, hash = %record.block_hash, number = %record.block_number, "state saved");
        Ok(record)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
