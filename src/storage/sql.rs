// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend.
//!
//! One `events` row per event, keyed by `event_id`, with the columns range
//! queries need and the full record as JSON in `payload`:
//!
//! ```sql
//! CREATE TABLE events (
//!   event_id BIGINT PRIMARY KEY,
//!   channel_id BIGINT NOT NULL,
//!   author_id BIGINT NOT NULL,
//!   created_at BIGINT NOT NULL,      -- epoch ms
//!   edited_at BIGINT,
//!   is_deleted TINYINT NOT NULL,
//!   content_hash VARCHAR(64) NOT NULL,
//!   payload LONGTEXT NOT NULL,       -- EventRecord as JSON
//!   INDEX idx_channel_created (channel_id, created_at)
//! )
//! ```
//!
//! Bookkeeping lives in `channel_coverage`, `sync_status`,
//! `sync_checkpoints` and `reconcile_queue`.
//!
//! ## sqlx Any driver quirks
//!
//! - `u64` can't be bound; IDs are stored as `BIGINT` (snowflakes fit in 63 bits).
//! - MySQL `LONGTEXT`/`TEXT` comes back as bytes, so text columns are read
//!   as `String` first and `Vec<u8>` second.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::collections::BTreeMap;
use std::sync::Once;
use std::time::Duration;

use super::traits::{BatchWriteResult, EventStore, StateStore, StorageError};
use crate::event_record::{ChannelId, EventId, EventRecord};
use crate::interval::{IntervalSet, TimeRange, HOUR_MILLIS};
use crate::resilience::reconcile::ReconcileEntry;
use crate::resilience::retry::{retry, retry_if, RetryConfig};
use crate::source::Direction;
use crate::sync_state::{ChannelCoverage, Checkpoint, SyncState, SyncStatus};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// MySQL `max_allowed_packet` is typically 16MB; 500 rows stays well under.
const CHUNK_SIZE: usize = 500;

/// Connection-level failures are outages; everything else is a backend error.
fn map_sqlx(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::Unavailable(e.to_string()),
        other => StorageError::Backend(other.to_string()),
    }
}

fn text(row: &sqlx::any::AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn int(row: &sqlx::any::AnyRow, column: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(column)
        .map_err(|e| StorageError::Backend(format!("column '{column}': {e}")))
}

fn corrupt(key: impl Into<String>, reason: impl ToString) -> StorageError {
    StorageError::Corruption {
        key: key.into(),
        reason: reason.to_string(),
    }
}

/// Row image of one record, prepared once so retries can rebind it.
#[derive(Clone)]
struct PreparedRow {
    event_id: i64,
    channel_id: i64,
    author_id: i64,
    created_at: i64,
    edited_at: Option<i64>,
    is_deleted: i64,
    content_hash: String,
    payload: String,
}

impl PreparedRow {
    fn new(record: &EventRecord) -> Result<Self, StorageError> {
        record.validate().map_err(|e| StorageError::InvalidRecord {
            event_id: record.event_id,
            reason: e.to_string(),
        })?;
        let payload = serde_json::to_string(record).map_err(|e| StorageError::InvalidRecord {
            event_id: record.event_id,
            reason: e.to_string(),
        })?;
        Ok(Self {
            event_id: record.event_id as i64,
            channel_id: record.channel_id as i64,
            author_id: record.author_id as i64,
            created_at: record.created_at,
            edited_at: record.edited_at,
            is_deleted: i64::from(record.is_deleted),
            content_hash: record.content_hash(),
            payload,
        })
    }
}

pub struct SqlEventStore {
    name: String,
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlEventStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the schema if needed.
    pub async fn connect(connection_string: &str, name: impl Into<String>) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 5 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))
        })
        .await?;

        let store = Self {
            name: name.into(),
            pool,
            is_sqlite,
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Concurrent readers during writes and a single fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS events (
                    event_id INTEGER PRIMARY KEY,
                    channel_id INTEGER NOT NULL,
                    author_id INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    edited_at INTEGER,
                    is_deleted INTEGER NOT NULL DEFAULT 0,
                    content_hash TEXT NOT NULL,
                    payload TEXT NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_events_channel_created ON events (channel_id, created_at)",
                r#"
                CREATE TABLE IF NOT EXISTS channel_coverage (
                    channel_id INTEGER PRIMARY KEY,
                    intervals TEXT NOT NULL,
                    last_verified_at INTEGER
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_status (
                    entity_name TEXT PRIMARY KEY,
                    last_sync_timestamp INTEGER NOT NULL,
                    records_synced INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    error_message TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_checkpoints (
                    checkpoint_key TEXT PRIMARY KEY,
                    channel_id INTEGER NOT NULL,
                    range_start INTEGER NOT NULL,
                    range_end INTEGER NOT NULL,
                    direction TEXT NOT NULL,
                    cursor_id INTEGER NOT NULL,
                    records_written INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS reconcile_queue (
                    event_id INTEGER PRIMARY KEY,
                    channel_id INTEGER NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    attempts INTEGER NOT NULL,
                    last_error TEXT
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS events (
                    event_id BIGINT PRIMARY KEY,
                    channel_id BIGINT NOT NULL,
                    author_id BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    edited_at BIGINT,
                    is_deleted TINYINT NOT NULL DEFAULT 0,
                    content_hash VARCHAR(64) NOT NULL,
                    payload LONGTEXT NOT NULL,
                    INDEX idx_channel_created (channel_id, created_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channel_coverage (
                    channel_id BIGINT PRIMARY KEY,
                    intervals LONGTEXT NOT NULL,
                    last_verified_at BIGINT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_status (
                    entity_name VARCHAR(255) PRIMARY KEY,
                    last_sync_timestamp BIGINT NOT NULL,
                    records_synced BIGINT NOT NULL,
                    status VARCHAR(32) NOT NULL,
                    error_message TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_checkpoints (
                    checkpoint_key VARCHAR(255) PRIMARY KEY,
                    channel_id BIGINT NOT NULL,
                    range_start BIGINT NOT NULL,
                    range_end BIGINT NOT NULL,
                    direction VARCHAR(16) NOT NULL,
                    cursor_id BIGINT NOT NULL,
                    records_written BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS reconcile_queue (
                    event_id BIGINT PRIMARY KEY,
                    channel_id BIGINT NOT NULL,
                    enqueued_at BIGINT NOT NULL,
                    attempts INT NOT NULL,
                    last_error TEXT,
                    INDEX idx_enqueued (enqueued_at)
                )
                "#,
            ]
        };

        for sql in statements {
            retry_if("sql_init_schema", &RetryConfig::startup(), StorageError::is_unavailable, || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx)
            })
            .await?;
        }
        Ok(())
    }

    /// `INSERT ... ON CONFLICT/ON DUPLICATE KEY` for `rows` rows of `columns`.
    fn upsert_sql(&self, table: &str, columns: &[&str], key: &str, rows: usize) -> String {
        let row = format!("({})", vec!["?"; columns.len()].join(", "));
        let values = vec![row; rows].join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != key)
            .map(|c| {
                if self.is_sqlite {
                    format!("{c} = excluded.{c}")
                } else {
                    format!("{c} = VALUES({c})")
                }
            })
            .collect();
        if self.is_sqlite {
            format!(
                "INSERT INTO {table} ({}) VALUES {values} ON CONFLICT({key}) DO UPDATE SET {}",
                columns.join(", "),
                updates.join(", ")
            )
        } else {
            format!(
                "INSERT INTO {table} ({}) VALUES {values} ON DUPLICATE KEY UPDATE {}",
                columns.join(", "),
                updates.join(", ")
            )
        }
    }

    const EVENT_COLUMNS: [&'static str; 8] = [
        "event_id",
        "channel_id",
        "author_id",
        "created_at",
        "edited_at",
        "is_deleted",
        "content_hash",
        "payload",
    ];

    async fn write_rows(&self, rows: &[PreparedRow]) -> Result<(), StorageError> {
        let sql = self.upsert_sql("events", &Self::EVENT_COLUMNS, "event_id", rows.len());
        retry_if("sql_upsert_events", &RetryConfig::batch_write(), StorageError::is_unavailable, || {
            let sql = sql.clone();
            async move {
                let mut query = sqlx::query(&sql);
                for row in rows {
                    query = query
                        .bind(row.event_id)
                        .bind(row.channel_id)
                        .bind(row.author_id)
                        .bind(row.created_at)
                        .bind(row.edited_at)
                        .bind(row.is_deleted)
                        .bind(row.content_hash.clone())
                        .bind(row.payload.clone());
                }
                query.execute(&self.pool).await.map_err(map_sqlx)?;
                Ok(())
            }
        })
        .await
    }

    /// Count how many of `ids` exist.
    async fn verify_ids(&self, ids: &[i64]) -> Result<usize, StorageError> {
        let mut found = 0usize;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!(
                "SELECT COUNT(*) AS cnt FROM events WHERE event_id IN ({})",
                vec!["?"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            let row = query.fetch_one(&self.pool).await.map_err(map_sqlx)?;
            found += int(&row, "cnt")? as usize;
        }
        Ok(found)
    }

    fn decode_record(row: &sqlx::any::AnyRow) -> Result<EventRecord, StorageError> {
        let id = int(row, "event_id")?;
        let payload = text(row, "payload").ok_or_else(|| corrupt(format!("event:{id}"), "missing payload"))?;
        serde_json::from_str(&payload).map_err(|e| corrupt(format!("event:{id}"), e))
    }

    fn decode_entry(row: &sqlx::any::AnyRow) -> Result<ReconcileEntry, StorageError> {
        Ok(ReconcileEntry {
            event_id: int(row, "event_id")? as EventId,
            channel_id: int(row, "channel_id")? as ChannelId,
            enqueued_at: int(row, "enqueued_at")?,
            attempts: int(row, "attempts")? as u32,
            last_error: text(row, "last_error"),
        })
    }
}

#[async_trait]
impl EventStore for SqlEventStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, record: &EventRecord) -> Result<(), StorageError> {
        let row = PreparedRow::new(record)?;
        self.write_rows(std::slice::from_ref(&row)).await
    }

    /// Multi-row upsert, chunked, then read back by ID.
    async fn upsert_batch(&self, records: &[EventRecord]) -> Result<BatchWriteResult, StorageError> {
        if records.is_empty() {
            return Ok(BatchWriteResult {
                batch_id: String::new(),
                written: 0,
                verified: true,
            });
        }
        let batch_id = uuid::Uuid::new_v4().to_string();
        let rows = records.iter().map(PreparedRow::new).collect::<Result<Vec<_>, _>>()?;

        for chunk in rows.chunks(CHUNK_SIZE) {
            self.write_rows(chunk).await?;
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.event_id).collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        let found = self.verify_ids(&unique).await?;
        let verified = found == unique.len();
        if !verified {
            tracing::warn!(
                batch_id = %batch_id,
                expected = unique.len(),
                actual = found,
                "Batch verification mismatch"
            );
        }

        Ok(BatchWriteResult {
            batch_id,
            written: rows.len(),
            verified,
        })
    }

    async fn get(&self, event_id: EventId) -> Result<Option<EventRecord>, StorageError> {
        retry_if("sql_get", &RetryConfig::query(), StorageError::is_unavailable, || async {
            let row = sqlx::query("SELECT event_id, payload FROM events WHERE event_id = ?")
                .bind(event_id as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
            row.as_ref().map(Self::decode_record).transpose()
        })
        .await
    }

    async fn range(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        retry_if("sql_range", &RetryConfig::query(), StorageError::is_unavailable, || async {
            let rows = sqlx::query(
                "SELECT event_id, payload FROM events \
                 WHERE channel_id = ? AND created_at >= ? AND created_at < ? \
                 ORDER BY event_id ASC LIMIT ?",
            )
            .bind(channel_id as i64)
            .bind(range.start)
            .bind(range.end)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            rows.iter().map(Self::decode_record).collect()
        })
        .await
    }

    async fn count_range(&self, channel_id: ChannelId, range: TimeRange) -> Result<u64, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM events WHERE channel_id = ? AND created_at >= ? AND created_at < ?",
        )
        .bind(channel_id as i64)
        .bind(range.start)
        .bind(range.end)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(int(&row, "cnt")? as u64)
    }

    async fn hourly_counts(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
    ) -> Result<BTreeMap<i64, u64>, StorageError> {
        let rows = sqlx::query(
            "SELECT (created_at - (created_at % ?)) AS bucket, COUNT(*) AS cnt FROM events \
             WHERE channel_id = ? AND created_at >= ? AND created_at < ? \
             GROUP BY bucket",
        )
        .bind(HOUR_MILLIS)
        .bind(channel_id as i64)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut buckets = BTreeMap::new();
        for row in &rows {
            buckets.insert(int(row, "bucket")?, int(row, "cnt")? as u64);
        }
        Ok(buckets)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqlEventStore {
    async fn load_coverage(&self, channel_id: ChannelId) -> Result<Option<ChannelCoverage>, StorageError> {
        let row = sqlx::query("SELECT intervals, last_verified_at FROM channel_coverage WHERE channel_id = ?")
            .bind(channel_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let key = format!("coverage:{channel_id}");
        let intervals = text(&row, "intervals").ok_or_else(|| corrupt(key.as_str(), "missing intervals"))?;
        let ranges: Vec<TimeRange> = serde_json::from_str(&intervals).map_err(|e| corrupt(key.as_str(), e))?;
        Ok(Some(ChannelCoverage {
            channel_id,
            complete: IntervalSet::from_ranges(ranges),
            last_verified_at: row.try_get::<Option<i64>, _>("last_verified_at").ok().flatten(),
        }))
    }

    async fn save_coverage(&self, coverage: &ChannelCoverage) -> Result<(), StorageError> {
        let intervals = serde_json::to_string(coverage.complete.ranges())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let sql = self.upsert_sql(
            "channel_coverage",
            &["channel_id", "intervals", "last_verified_at"],
            "channel_id",
            1,
        );
        sqlx::query(&sql)
            .bind(coverage.channel_id as i64)
            .bind(intervals)
            .bind(coverage.last_verified_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_status(&self, entity_name: &str) -> Result<Option<SyncStatus>, StorageError> {
        let row = sqlx::query(
            "SELECT last_sync_timestamp, records_synced, status, error_message FROM sync_status WHERE entity_name = ?",
        )
        .bind(entity_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status = text(&row, "status")
            .ok_or_else(|| corrupt(entity_name, "missing status"))?
            .parse::<SyncState>()
            .map_err(|e| corrupt(entity_name, e))?;
        Ok(Some(SyncStatus {
            entity_name: entity_name.to_string(),
            last_sync_timestamp: int(&row, "last_sync_timestamp")?,
            records_synced: int(&row, "records_synced")? as u64,
            status,
            error_message: text(&row, "error_message"),
        }))
    }

    async fn save_status(&self, status: &SyncStatus) -> Result<(), StorageError> {
        let sql = self.upsert_sql(
            "sync_status",
            &["entity_name", "last_sync_timestamp", "records_synced", "status", "error_message"],
            "entity_name",
            1,
        );
        sqlx::query(&sql)
            .bind(status.entity_name.clone())
            .bind(status.last_sync_timestamp)
            .bind(status.records_synced as i64)
            .bind(status.status.as_str())
            .bind(status.error_message.clone())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_checkpoint(&self, key: &str) -> Result<Option<Checkpoint>, StorageError> {
        let row = sqlx::query(
            "SELECT channel_id, range_start, range_end, direction, cursor_id, records_written, updated_at \
             FROM sync_checkpoints WHERE checkpoint_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let direction = match text(&row, "direction").as_deref() {
            Some("ascending") => Direction::Ascending,
            Some("descending") => Direction::Descending,
            other => return Err(corrupt(key, format!("unknown direction {other:?}"))),
        };
        Ok(Some(Checkpoint {
            key: key.to_string(),
            channel_id: int(&row, "channel_id")? as ChannelId,
            range: TimeRange::new(int(&row, "range_start")?, int(&row, "range_end")?),
            direction,
            cursor: int(&row, "cursor_id")? as EventId,
            records_written: int(&row, "records_written")? as u64,
            updated_at: int(&row, "updated_at")?,
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let sql = self.upsert_sql(
            "sync_checkpoints",
            &[
                "checkpoint_key",
                "channel_id",
                "range_start",
                "range_end",
                "direction",
                "cursor_id",
                "records_written",
                "updated_at",
            ],
            "checkpoint_key",
            1,
        );
        sqlx::query(&sql)
            .bind(checkpoint.key.clone())
            .bind(checkpoint.channel_id as i64)
            .bind(checkpoint.range.start)
            .bind(checkpoint.range.end)
            .bind(checkpoint.direction.as_str())
            .bind(checkpoint.cursor as i64)
            .bind(checkpoint.records_written as i64)
            .bind(checkpoint.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn clear_checkpoint(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_checkpoints WHERE checkpoint_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn enqueue_reconcile(&self, entries: &[ReconcileEntry]) -> Result<(), StorageError> {
        let columns = ["event_id", "channel_id", "enqueued_at", "attempts", "last_error"];
        for chunk in entries.chunks(CHUNK_SIZE) {
            let sql = self.upsert_sql("reconcile_queue", &columns, "event_id", chunk.len());
            let mut query = sqlx::query(&sql);
            for entry in chunk {
                query = query
                    .bind(entry.event_id as i64)
                    .bind(entry.channel_id as i64)
                    .bind(entry.enqueued_at)
                    .bind(i64::from(entry.attempts))
                    .bind(entry.last_error.clone());
            }
            query.execute(&self.pool).await.map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn pending_reconcile(&self, limit: usize) -> Result<Vec<ReconcileEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT event_id, channel_id, enqueued_at, attempts, last_error FROM reconcile_queue \
             ORDER BY enqueued_at ASC, event_id ASC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(Self::decode_entry).collect()
    }

    async fn ack_reconcile(&self, event_ids: &[EventId]) -> Result<(), StorageError> {
        for chunk in event_ids.chunks(CHUNK_SIZE) {
            let sql = format!(
                "DELETE FROM reconcile_queue WHERE event_id IN ({})",
                vec!["?"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id as i64);
            }
            query.execute(&self.pool).await.map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn reconcile_len(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM reconcile_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(int(&row, "cnt")? as u64)
    }
}
