//! SQLite storage backend for ChainPoll.
//!
//! Persists blocks, logs, filters, poller progress and tracked heads to a
//! single SQLite file, partitioned by chain id. Uses `sqlx` with WAL mode so
//! query readers never block the poll loop's write transactions.
//!
//! # Usage
//! ```rust,no_run
//! use chainpoll_core::ChainId;
//! use chainpoll_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let storage = SqliteStorage::open("./chainpoll.db").await?;
//! let mainnet = storage.scoped(ChainId(1));
//!
//! // In-memory (tests / ephemeral)
//! let storage = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use chainpoll_core::error::PollerError;
use chainpoll_core::filter::{Filter, RetentionRule};
use chainpoll_core::store::{confirmation_bound, excess_logs, HeadStore, LogSelection, LogStore, WordMatch, TOPIC_HEX_LEN};
use chainpoll_core::types::{word_hex, Block, ChainId, Confirmations, Log, PollerState};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        chain_id     INTEGER NOT NULL,
        number       INTEGER NOT NULL,
        hash         TEXT    NOT NULL,
        parent_hash  TEXT    NOT NULL,
        timestamp    INTEGER NOT NULL,
        PRIMARY KEY (chain_id, number)
    );",
    "CREATE TABLE IF NOT EXISTS logs (
        chain_id        INTEGER NOT NULL,
        block_hash      TEXT    NOT NULL,
        log_index       INTEGER NOT NULL,
        block_number    INTEGER NOT NULL,
        tx_hash         TEXT    NOT NULL,
        address         TEXT    NOT NULL,
        event_sig       TEXT    NOT NULL,
        topics          TEXT    NOT NULL,
        data            BLOB    NOT NULL,
        block_timestamp INTEGER NOT NULL,
        created_at      INTEGER NOT NULL,
        PRIMARY KEY (chain_id, block_hash, log_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_logs_position ON logs (chain_id, block_number, log_index);",
    "CREATE INDEX IF NOT EXISTS idx_logs_event ON logs (chain_id, address, event_sig, block_number);",
    "CREATE INDEX IF NOT EXISTS idx_logs_tx ON logs (chain_id, tx_hash);",
    "CREATE TABLE IF NOT EXISTS filters (
        chain_id    INTEGER NOT NULL,
        name        TEXT    NOT NULL,
        definition  TEXT    NOT NULL,
        PRIMARY KEY (chain_id, name)
    );",
    "CREATE TABLE IF NOT EXISTS poller_state (
        chain_id             INTEGER PRIMARY KEY,
        last_processed_block INTEGER NOT NULL,
        last_finalized_block INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS heads (
        chain_id     INTEGER NOT NULL,
        number       INTEGER NOT NULL,
        hash         TEXT    NOT NULL,
        parent_hash  TEXT    NOT NULL,
        timestamp    INTEGER NOT NULL,
        PRIMARY KEY (chain_id, number)
    );",
];

const LOG_COLUMNS: &str = "block_number, block_hash, tx_hash, log_index, address, event_sig, \
                           topics, data, block_timestamp, created_at";

fn db_err(e: sqlx::Error) -> PollerError {
    PollerError::Storage(e.to_string())
}

/// Appends ` AND {expr} IN (values...)`.
fn push_in(qb: &mut QueryBuilder<'_, Sqlite>, expr: &str, values: &[String]) {
    qb.push(format!(" AND {expr} IN ("));
    let mut list = qb.separated(", ");
    for value in values {
        list.push_bind(value.clone());
    }
    list.push_unseparated(")");
}

fn topic_expr(table: &str, index: usize) -> String {
    format!("json_extract({table}.topics, '$[{index}]')")
}

/// Appends the bounds of a 32-byte word comparison on the `logs` row.
fn push_word(qb: &mut QueryBuilder<'_, Sqlite>, word: &WordMatch) {
    let data_word = |index: usize| format!("substr(logs.data, {}, 32)", 32 * index + 1);
    let has_word = |index: usize| format!(" AND length(logs.data) >= {}", 32 * (index + 1));
    match word {
        WordMatch::DataRange { index, min, max } => {
            qb.push(has_word(*index));
            if let Some(min) = min {
                qb.push(format!(" AND {} >= ", data_word(*index))).push_bind(min.to_vec());
            }
            if let Some(max) = max {
                qb.push(format!(" AND {} <= ", data_word(*index))).push_bind(max.to_vec());
            }
        }
        WordMatch::DataBetween { lower, upper, value } => {
            qb.push(has_word(*lower.max(upper)));
            qb.push(format!(" AND {} <= ", data_word(*lower))).push_bind(value.to_vec());
            qb.push(format!(" AND {} >= ", data_word(*upper))).push_bind(value.to_vec());
        }
        WordMatch::TopicRange { index, min, max } => {
            let topic = topic_expr("logs", *index);
            qb.push(format!(" AND length({topic}) = {TOPIC_HEX_LEN}"));
            if let Some(min) = min {
                qb.push(format!(" AND {topic} >= ")).push_bind(word_hex(min));
            }
            if let Some(max) = max {
                qb.push(format!(" AND {topic} <= ")).push_bind(word_hex(max));
            }
        }
    }
}

/// SQLite database shared by every chain. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainpoll.db"`) or a full
    /// SQLite URL (`"sqlite:./chainpoll.db"`).
    pub async fn open(path: &str) -> Result<Self, PollerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        debug!(url = %url, "sqlite storage opened");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// The pool holds a single connection that is never recycled, since each
    /// connection to `:memory:` is a separate database. All data is lost when
    /// the storage is dropped.
    pub async fn in_memory() -> Result<Self, PollerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), PollerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    /// A store handle for one chain.
    pub fn scoped(&self, chain_id: ChainId) -> SqliteChainStore {
        SqliteChainStore {
            pool: self.pool.clone(),
            chain_id,
        }
    }

    /// Progress of every chain that has committed at least one batch.
    pub async fn chain_states(&self) -> Result<Vec<(ChainId, PollerState)>, PollerError> {
        let rows = sqlx::query(
            "SELECT chain_id, last_processed_block, last_finalized_block
             FROM poller_state ORDER BY chain_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let chain_id: i64 = row.try_get("chain_id")?;
                Ok((ChainId(chain_id as u64), state_from_row(row)?))
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(db_err)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ─── Row mapping ──────────────────────────────────────────────────────────────

fn block_from_row(row: &SqliteRow) -> Result<Block, sqlx::Error> {
    Ok(Block {
        number: row.try_get("number")?,
        hash: row.try_get("hash")?,
        parent_hash: row.try_get("parent_hash")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn state_from_row(row: &SqliteRow) -> Result<PollerState, sqlx::Error> {
    Ok(PollerState {
        last_processed_block: row.try_get("last_processed_block")?,
        last_finalized_block: row.try_get("last_finalized_block")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<Log, PollerError> {
    let topics: String = row.try_get("topics").map_err(db_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(db_err)?;
    Ok(Log {
        block_number: row.try_get("block_number").map_err(db_err)?,
        block_hash: row.try_get("block_hash").map_err(db_err)?,
        tx_hash: row.try_get("tx_hash").map_err(db_err)?,
        log_index: row.try_get("log_index").map_err(db_err)?,
        address: row.try_get("address").map_err(db_err)?,
        event_sig: row.try_get("event_sig").map_err(db_err)?,
        topics: serde_json::from_str(&topics).map_err(|e| PollerError::Storage(format!("corrupt topics: {e}")))?,
        data: row.try_get("data").map_err(db_err)?,
        block_timestamp: row.try_get("block_timestamp").map_err(db_err)?,
        created_at: DateTime::<Utc>::from_timestamp_micros(created_at)
            .ok_or_else(|| PollerError::Storage(format!("corrupt created_at {created_at}")))?,
    })
}

// ─── SqliteChainStore ─────────────────────────────────────────────────────────

/// A [`LogStore`] and [`HeadStore`] over one chain's rows.
#[derive(Debug, Clone)]
pub struct SqliteChainStore {
    pool: SqlitePool,
    chain_id: ChainId,
}

impl SqliteChainStore {
    fn chain(&self) -> i64 {
        self.chain_id.0 as i64
    }

    async fn upsert_block(&self, conn: &mut SqliteConnection, block: &Block) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM logs WHERE chain_id = ? AND block_number = ? AND block_hash != ?")
            .bind(self.chain())
            .bind(block.number)
            .bind(&block.hash)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "INSERT INTO blocks (chain_id, number, hash, parent_hash, timestamp)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, number) DO UPDATE SET
                hash = excluded.hash,
                parent_hash = excluded.parent_hash,
                timestamp = excluded.timestamp",
        )
        .bind(self.chain())
        .bind(block.number)
        .bind(&block.hash)
        .bind(&block.parent_hash)
        .bind(block.timestamp)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn insert_log(&self, conn: &mut SqliteConnection, log: &Log) -> Result<(), PollerError> {
        let topics = serde_json::to_string(&log.topics).map_err(|e| PollerError::Storage(e.to_string()))?;
        sqlx::query(&format!(
            "INSERT INTO logs (chain_id, {LOG_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, block_hash, log_index) DO NOTHING"
        ))
        .bind(self.chain())
        .bind(log.block_number)
        .bind(&log.block_hash)
        .bind(&log.tx_hash)
        .bind(log.log_index)
        .bind(&log.address)
        .bind(&log.event_sig)
        .bind(topics)
        .bind(&log.data)
        .bind(log.block_timestamp)
        .bind(log.created_at.timestamp_micros())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_state(&self, conn: &mut SqliteConnection, state: PollerState) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO poller_state (chain_id, last_processed_block, last_finalized_block)
             VALUES (?, ?, ?)
             ON CONFLICT (chain_id) DO UPDATE SET
                last_processed_block = excluded.last_processed_block,
                last_finalized_block = excluded.last_finalized_block",
        )
        .bind(self.chain())
        .bind(state.last_processed_block)
        .bind(state.last_finalized_block)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn delete_from(&self, conn: &mut SqliteConnection, from: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM logs WHERE chain_id = ? AND block_number >= ?")
            .bind(self.chain())
            .bind(from)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM blocks WHERE chain_id = ? AND number >= ?")
            .bind(self.chain())
            .bind(from)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn write_batch(
        &self,
        conn: &mut SqliteConnection,
        blocks: &[Block],
        logs: &[Log],
        state: PollerState,
    ) -> Result<(), PollerError> {
        for block in blocks {
            self.upsert_block(conn, block).await.map_err(db_err)?;
        }
        for log in logs {
            self.insert_log(conn, log).await?;
        }
        self.write_state(conn, state).await.map_err(db_err)
    }

    /// Upper block bound for a confirmation-bounded read. The outer `None`
    /// means nothing qualifies.
    async fn bound(
        &self,
        conn: &mut SqliteConnection,
        confirmations: Option<Confirmations>,
    ) -> Result<Option<Option<i64>>, sqlx::Error> {
        let Some(confirmations) = confirmations else {
            return Ok(Some(None));
        };
        let latest: Option<i64> = sqlx::query("SELECT MAX(number) AS latest FROM blocks WHERE chain_id = ?")
            .bind(self.chain())
            .fetch_one(&mut *conn)
            .await?
            .try_get("latest")?;
        let finalized = sqlx::query("SELECT last_finalized_block FROM poller_state WHERE chain_id = ?")
            .bind(self.chain())
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| row.try_get::<i64, _>("last_finalized_block"))
            .transpose()?
            .unwrap_or(0);
        Ok(confirmation_bound(confirmations, latest, finalized).map(Some))
    }

    fn selection_query<'a>(&self, selection: &LogSelection, bound: Option<i64>) -> QueryBuilder<'a, Sqlite> {
        let mut qb = QueryBuilder::new(format!("SELECT {LOG_COLUMNS} FROM logs WHERE logs.chain_id = "));
        qb.push_bind(self.chain());

        if !selection.addresses.is_empty() {
            push_in(&mut qb, "address", &selection.addresses);
        }
        if !selection.event_sigs.is_empty() {
            push_in(&mut qb, "event_sig", &selection.event_sigs);
        }
        if let Some(from) = selection.from_block {
            qb.push(" AND block_number >= ").push_bind(from);
        }
        if let Some(to) = selection.to_block {
            qb.push(" AND block_number <= ").push_bind(to);
        }
        if let Some(bound) = bound {
            qb.push(" AND block_number <= ").push_bind(bound);
        }
        if let Some(topic) = &selection.topic {
            push_in(&mut qb, &topic_expr("logs", topic.index), &topic.values);
        }
        if let Some(tx_hash) = &selection.tx_hash {
            qb.push(" AND tx_hash = ").push_bind(tx_hash.clone());
        }
        if let Some(after) = selection.created_after {
            qb.push(" AND created_at > ").push_bind(after.timestamp_micros());
        }
        if let Some(word) = &selection.word {
            push_word(&mut qb, word);
        }
        if let Some(counterpart) = &selection.without_counterpart {
            let index = counterpart.topic_index;
            qb.push(format!(
                " AND NOT EXISTS (SELECT 1 FROM logs b WHERE b.chain_id = logs.chain_id \
                 AND b.address = logs.address AND {} = {} AND b.event_sig = ",
                topic_expr("b", index),
                topic_expr("logs", index),
            ))
            .push_bind(counterpart.event_sig.clone());
            if let Some(from) = selection.from_block {
                qb.push(" AND b.block_number >= ").push_bind(from);
            }
            if let Some(to) = selection.to_block {
                qb.push(" AND b.block_number <= ").push_bind(to);
            }
            if let Some(bound) = bound {
                qb.push(" AND b.block_number <= ").push_bind(bound);
            }
            qb.push(")");
        }
        qb
    }

    /// Logs matching `filter` at or below `up_to`, newest first, past the
    /// filter's cap.
    fn over_cap_query<'a>(&self, filter: &Filter, up_to: i64) -> QueryBuilder<'a, Sqlite> {
        let mut qb = QueryBuilder::new(format!("SELECT {LOG_COLUMNS} FROM logs WHERE logs.chain_id = "));
        qb.push_bind(self.chain());
        qb.push(" AND block_number <= ").push_bind(up_to);
        push_in(&mut qb, "address", &filter.addresses);
        push_in(&mut qb, "event_sig", &filter.event_sigs);
        for (index, values) in [(1, &filter.topic2), (2, &filter.topic3), (3, &filter.topic4)] {
            if !values.is_empty() {
                push_in(&mut qb, &topic_expr("logs", index), values);
            }
        }
        qb.push(" ORDER BY block_number DESC, log_index DESC LIMIT -1 OFFSET ")
            .push_bind(i64::try_from(filter.max_logs_kept).unwrap_or(i64::MAX));
        qb
    }

    /// Runs a selection inside one read transaction, so the confirmation
    /// bound and the rows come from the same snapshot.
    async fn select(
        &self,
        selection: &LogSelection,
        order: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Log>, PollerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let Some(bound) = self.bound(&mut *tx, selection.confirmations).await.map_err(db_err)? else {
            return Ok(vec![]);
        };
        let mut qb = self.selection_query(selection, bound);
        qb.push(order);
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb.build().fetch_all(&mut *tx).await.map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        rows.iter().map(log_from_row).collect()
    }

    /// Number of stored logs for this chain.
    pub async fn log_count(&self) -> Result<u64, PollerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM logs WHERE chain_id = ?")
            .bind(self.chain())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let cnt: i64 = row.try_get("cnt").map_err(db_err)?;
        Ok(cnt as u64)
    }
}

#[async_trait]
impl LogStore for SqliteChainStore {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn ping(&self) -> Result<(), PollerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_blocks_and_logs(
        &self,
        blocks: &[Block],
        logs: &[Log],
        state: PollerState,
    ) -> Result<(), PollerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        self.write_batch(&mut *tx, blocks, logs, state).await?;
        tx.commit().await.map_err(db_err)?;
        debug!(chain_id = %self.chain_id, blocks = blocks.len(), logs = logs.len(), "batch stored");
        Ok(())
    }

    async fn replace_from_block(
        &self,
        from: i64,
        blocks: &[Block],
        logs: &[Log],
        state: PollerState,
    ) -> Result<(), PollerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        self.delete_from(&mut *tx, from).await.map_err(db_err)?;
        self.write_batch(&mut *tx, blocks, logs, state).await?;
        tx.commit().await.map_err(db_err)?;
        debug!(chain_id = %self.chain_id, from, blocks = blocks.len(), logs = logs.len(), "replaced blocks");
        Ok(())
    }

    async fn delete_from_block(&self, from: i64) -> Result<(), PollerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        self.delete_from(&mut *tx, from).await.map_err(db_err)?;
        sqlx::query(
            "UPDATE poller_state SET last_processed_block = MIN(last_processed_block, ?)
             WHERE chain_id = ?",
        )
        .bind(from - 1)
        .bind(self.chain())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        debug!(chain_id = %self.chain_id, from, "rolled back storage");
        Ok(())
    }

    async fn poller_state(&self) -> Result<Option<PollerState>, PollerError> {
        let row = sqlx::query(
            "SELECT last_processed_block, last_finalized_block FROM poller_state WHERE chain_id = ?",
        )
        .bind(self.chain())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(state_from_row).transpose().map_err(db_err)
    }

    async fn latest_block(&self) -> Result<Option<Block>, PollerError> {
        let row = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM blocks
             WHERE chain_id = ? ORDER BY number DESC LIMIT 1",
        )
        .bind(self.chain())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(block_from_row).transpose().map_err(db_err)
    }

    async fn oldest_block(&self) -> Result<Option<Block>, PollerError> {
        let row = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM blocks
             WHERE chain_id = ? ORDER BY number ASC LIMIT 1",
        )
        .bind(self.chain())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(block_from_row).transpose().map_err(db_err)
    }

    async fn block_by_number(&self, number: i64) -> Result<Option<Block>, PollerError> {
        let row = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM blocks
             WHERE chain_id = ? AND number = ?",
        )
        .bind(self.chain())
        .bind(number)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(block_from_row).transpose().map_err(db_err)
    }

    async fn blocks_range(&self, from: i64, to: i64) -> Result<Vec<Block>, PollerError> {
        let rows = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM blocks
             WHERE chain_id = ? AND number BETWEEN ? AND ? ORDER BY number",
        )
        .bind(self.chain())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(block_from_row).collect::<Result<_, _>>().map_err(db_err)
    }

    async fn select_logs(&self, selection: &LogSelection) -> Result<Vec<Log>, PollerError> {
        self.select(selection, " ORDER BY block_number, log_index", None).await
    }

    async fn select_latest_log(&self, selection: &LogSelection) -> Result<Option<Log>, PollerError> {
        let mut logs = self
            .select(selection, " ORDER BY block_number DESC, log_index DESC", Some(1))
            .await?;
        Ok(logs.pop())
    }

    async fn insert_filter(&self, filter: &Filter) -> Result<(), PollerError> {
        let definition = serde_json::to_string(filter).map_err(|e| PollerError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO filters (chain_id, name, definition) VALUES (?, ?, ?)
             ON CONFLICT (chain_id, name) DO UPDATE SET definition = excluded.definition",
        )
        .bind(self.chain())
        .bind(&filter.name)
        .bind(definition)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        debug!(chain_id = %self.chain_id, name = %filter.name, "filter stored");
        Ok(())
    }

    async fn delete_filter(&self, name: &str) -> Result<bool, PollerError> {
        let result = sqlx::query("DELETE FROM filters WHERE chain_id = ? AND name = ?")
            .bind(self.chain())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_filters(&self) -> Result<Vec<Filter>, PollerError> {
        let rows = sqlx::query("SELECT name, definition FROM filters WHERE chain_id = ? ORDER BY name")
            .bind(self.chain())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let name: String = row.try_get("name").map_err(db_err)?;
                let definition: String = row.try_get("definition").map_err(db_err)?;
                serde_json::from_str(&definition)
                    .map_err(|e| PollerError::Storage(format!("corrupt filter '{name}': {e}")))
            })
            .collect()
    }

    async fn delete_blocks_before(&self, end: i64, limit: u64) -> Result<u64, PollerError> {
        // LIMIT -1 is unbounded in SQLite.
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let result = sqlx::query(
            "DELETE FROM blocks WHERE rowid IN (
                SELECT b.rowid FROM blocks b
                WHERE b.chain_id = ? AND b.number < ?
                  AND NOT EXISTS (
                    SELECT 1 FROM logs l WHERE l.chain_id = b.chain_id AND l.block_number = b.number
                  )
                ORDER BY b.number
                LIMIT ?
            )",
        )
        .bind(self.chain())
        .bind(end)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_logs(
        &self,
        rules: &[RetentionRule],
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64, PollerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut deleted = 0u64;
        for rule in rules {
            let remaining = if limit == 0 { -1 } else { limit.saturating_sub(deleted) as i64 };
            if remaining == 0 {
                break;
            }
            let cutoff = now.timestamp() - rule.max_age.as_secs() as i64;
            let result = sqlx::query(
                "DELETE FROM logs WHERE rowid IN (
                    SELECT rowid FROM logs
                    WHERE chain_id = ? AND address = ? AND event_sig = ? AND block_timestamp < ?
                    ORDER BY block_number, log_index
                    LIMIT ?
                )",
            )
            .bind(self.chain())
            .bind(&rule.address)
            .bind(&rule.event_sig)
            .bind(cutoff)
            .bind(remaining)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            deleted += result.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(deleted)
    }

    async fn delete_excess_logs(&self, filters: &[Filter], up_to: i64, limit: u64) -> Result<u64, PollerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut over_cap = Vec::new();
        for filter in filters.iter().filter(|f| f.max_logs_kept > 0) {
            let rows = self.over_cap_query(filter, up_to).build().fetch_all(&mut *tx).await.map_err(db_err)?;
            let logs = rows.iter().map(log_from_row).collect::<Result<Vec<_>, _>>()?;
            over_cap.push((filter.name.as_str(), logs));
        }
        let doomed = excess_logs(filters, over_cap, limit);
        for log in &doomed {
            sqlx::query("DELETE FROM logs WHERE chain_id = ? AND block_hash = ? AND log_index = ?")
                .bind(self.chain())
                .bind(&log.block_hash)
                .bind(log.log_index)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl HeadStore for SqliteChainStore {
    async fn save_heads(&self, heads: &[Block]) -> Result<(), PollerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for head in heads {
            sqlx::query(
                "INSERT INTO heads (chain_id, number, hash, parent_hash, timestamp)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (chain_id, number) DO UPDATE SET
                    hash = excluded.hash,
                    parent_hash = excluded.parent_hash,
                    timestamp = excluded.timestamp",
            )
            .bind(self.chain())
            .bind(head.number)
            .bind(&head.hash)
            .bind(&head.parent_hash)
            .bind(head.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn load_heads(&self, limit: usize) -> Result<Vec<Block>, PollerError> {
        let rows = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM heads
             WHERE chain_id = ? ORDER BY number DESC LIMIT ?",
        )
        .bind(self.chain())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut heads = rows.iter().map(block_from_row).collect::<Result<Vec<_>, _>>().map_err(db_err)?;
        heads.reverse();
        Ok(heads)
    }

    async fn delete_heads_after(&self, number: i64) -> Result<(), PollerError> {
        sqlx::query("DELETE FROM heads WHERE chain_id = ? AND number > ?")
            .bind(self.chain())
            .bind(number)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn trim_heads_below(&self, number: i64) -> Result<(), PollerError> {
        sqlx::query("DELETE FROM heads WHERE chain_id = ? AND number < ?")
            .bind(self.chain())
            .bind(number)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
