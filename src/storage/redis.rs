// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis storage backend.
//!
//! Key layout (all keys carry the optional prefix):
//!
//! ```text
//! event:{event_id}          STRING  EventRecord as JSON
//! channel:{id}:events       ZSET    event_id scored by created_at
//! coverage:{channel_id}     STRING  ChannelCoverage as JSON
//! status:{entity_name}      STRING  SyncStatus as JSON
//! checkpoint:{key}          STRING  Checkpoint as JSON
//! reconcile                 HASH    event_id -> ReconcileEntry as JSON
//! ```
//!
//! A record write is one `MULTI` pipeline (`SET` + `ZADD`), so the document
//! and its index entry land together. Range queries read the sorted set
//! with an exclusive upper score and `MGET` the documents.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, RedisError};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::traits::{BatchWriteResult, EventStore, StateStore, StorageError};
use crate::event_record::{ChannelId, EventId, EventRecord};
use crate::interval::TimeRange;
use crate::resilience::reconcile::ReconcileEntry;
use crate::resilience::retry::{retry, retry_if, RetryConfig};
use crate::sync_state::{ChannelCoverage, Checkpoint, SyncStatus};

/// Connection-level failures are outages; everything else is a backend error.
fn is_outage(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
}

fn map_redis(e: RedisError) -> StorageError {
    if is_outage(&e) {
        StorageError::Unavailable(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Backend(e.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Corruption {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub struct RedisEventStore {
    name: String,
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "archive:" → "archive:event:42")
    prefix: String,
}

impl RedisEventStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str, name: impl Into<String>) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None, name).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// The prefix is prepended to all keys, enabling namespacing when
    /// sharing a Redis instance with other applications.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use archive_sync::storage::redis::RedisEventStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be prefixed: "archive:event:42", "archive:channel:7:events"
    /// let store = RedisEventStore::with_prefix("redis://localhost", Some("archive:"), "secondary").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(
        connection_string: &str,
        prefix: Option<&str>,
        name: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        // Use startup config: fast-fail, don't hang forever
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: RedisError| StorageError::Unavailable(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn event_key(&self, event_id: EventId) -> String {
        format!("{}event:{}", self.prefix, event_id)
    }

    fn channel_key(&self, channel_id: ChannelId) -> String {
        format!("{}channel:{}:events", self.prefix, channel_id)
    }

    fn coverage_key(&self, channel_id: ChannelId) -> String {
        format!("{}coverage:{}", self.prefix, channel_id)
    }

    fn status_key(&self, entity_name: &str) -> String {
        format!("{}status:{}", self.prefix, entity_name)
    }

    fn checkpoint_key(&self, key: &str) -> String {
        format!("{}checkpoint:{}", self.prefix, key)
    }

    fn reconcile_key(&self) -> String {
        format!("{}reconcile", self.prefix)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>, StorageError> {
        let conn = self.connection.clone();
        let raw: Option<String> = retry_if("redis_get", &RetryConfig::query(), is_outage, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let raw: Option<String> = conn.get(&key).await?;
                Ok::<_, RedisError>(raw)
            }
        })
        .await
        .map_err(map_redis)?;
        raw.map(|s| decode(&key, &s)).transpose()
    }

    async fn set_json<T: Serialize>(&self, key: String, value: &T) -> Result<(), StorageError> {
        let doc = encode(value)?;
        let conn = self.connection.clone();
        retry_if("redis_set", &RetryConfig::query(), is_outage, || {
            let mut conn = conn.clone();
            let key = key.clone();
            let doc = doc.clone();
            async move {
                let _: () = conn.set(&key, &doc).await?;
                Ok::<_, RedisError>(())
            }
        })
        .await
        .map_err(map_redis)
    }

    /// Event IDs of a channel with `created_at` in `range`.
    async fn ids_in_range(&self, channel_id: ChannelId, range: TimeRange) -> Result<Vec<EventId>, StorageError> {
        let conn = self.connection.clone();
        let key = self.channel_key(channel_id);
        retry_if("redis_zrangebyscore", &RetryConfig::query(), is_outage, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let ids: Vec<EventId> = cmd("ZRANGEBYSCORE")
                    .arg(&key)
                    .arg(range.start)
                    .arg(format!("({}", range.end))
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, RedisError>(ids)
            }
        })
        .await
        .map_err(map_redis)
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, record: &EventRecord) -> Result<(), StorageError> {
        self.upsert_batch(std::slice::from_ref(record)).await.map(|_| ())
    }

    /// Pipelined, transactional batch write.
    async fn upsert_batch(&self, records: &[EventRecord]) -> Result<BatchWriteResult, StorageError> {
        if records.is_empty() {
            return Ok(BatchWriteResult {
                batch_id: String::new(),
                written: 0,
                verified: true,
            });
        }

        // (event key, channel key, score, member, document)
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            record.validate().map_err(|e| StorageError::InvalidRecord {
                event_id: record.event_id,
                reason: e.to_string(),
            })?;
            prepared.push((
                self.event_key(record.event_id),
                self.channel_key(record.channel_id),
                record.created_at,
                record.event_id,
                encode(record)?,
            ));
        }

        let conn = self.connection.clone();
        retry_if("redis_upsert_batch", &RetryConfig::batch_write(), is_outage, || {
            let mut conn = conn.clone();
            let prepared = &prepared;
            async move {
                let mut pipeline = pipe();
                pipeline.atomic();
                for (event_key, channel_key, score, member, doc) in prepared {
                    pipeline.set(event_key, doc).ignore();
                    pipeline.zadd(channel_key, *member, *score).ignore();
                }
                let _: () = pipeline.query_async(&mut conn).await?;
                Ok::<_, RedisError>(())
            }
        })
        .await
        .map_err(map_redis)?;

        Ok(BatchWriteResult {
            batch_id: uuid::Uuid::new_v4().to_string(),
            written: records.len(),
            verified: true,
        })
    }

    async fn get(&self, event_id: EventId) -> Result<Option<EventRecord>, StorageError> {
        self.get_json(self.event_key(event_id)).await
    }

    async fn range(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let mut ids = self.ids_in_range(channel_id, range).await?;
        ids.sort_unstable();
        ids.truncate(limit);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.event_key(*id)).collect();
        let conn = self.connection.clone();
        let docs: Vec<Option<String>> = retry_if("redis_mget", &RetryConfig::query(), is_outage, || {
            let mut conn = conn.clone();
            let keys = &keys;
            async move {
                let docs: Vec<Option<String>> = cmd("MGET").arg(keys).query_async(&mut conn).await?;
                Ok::<_, RedisError>(docs)
            }
        })
        .await
        .map_err(map_redis)?;

        let mut records = Vec::with_capacity(docs.len());
        for (key, doc) in keys.iter().zip(docs) {
            // Index entry without a document: skip, the next write repairs it.
            if let Some(doc) = doc {
                records.push(decode(key, &doc)?);
            }
        }
        Ok(records)
    }

    async fn count_range(&self, channel_id: ChannelId, range: TimeRange) -> Result<u64, StorageError> {
        let conn = self.connection.clone();
        let key = self.channel_key(channel_id);
        retry_if("redis_zcount", &RetryConfig::query(), is_outage, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let count: u64 = cmd("ZCOUNT")
                    .arg(&key)
                    .arg(range.start)
                    .arg(format!("({}", range.end))
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, RedisError>(count)
            }
        })
        .await
        .map_err(map_redis)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(map_redis)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisEventStore {
    async fn load_coverage(&self, channel_id: ChannelId) -> Result<Option<ChannelCoverage>, StorageError> {
        self.get_json(self.coverage_key(channel_id)).await
    }

    async fn save_coverage(&self, coverage: &ChannelCoverage) -> Result<(), StorageError> {
        self.set_json(self.coverage_key(coverage.channel_id), coverage).await
    }

    async fn load_status(&self, entity_name: &str) -> Result<Option<SyncStatus>, StorageError> {
        self.get_json(self.status_key(entity_name)).await
    }

    async fn save_status(&self, status: &SyncStatus) -> Result<(), StorageError> {
        self.set_json(self.status_key(&status.entity_name), status).await
    }

    async fn load_checkpoint(&self, key: &str) -> Result<Option<Checkpoint>, StorageError> {
        self.get_json(self.checkpoint_key(key)).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.set_json(self.checkpoint_key(&checkpoint.key), checkpoint).await
    }

    async fn clear_checkpoint(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.checkpoint_key(key)).await.map_err(map_redis)?;
        Ok(())
    }

    async fn enqueue_reconcile(&self, entries: &[ReconcileEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let fields = entries
            .iter()
            .map(|e| Ok((e.event_id, encode(e)?)))
            .collect::<Result<Vec<(EventId, String)>, StorageError>>()?;
        let mut conn = self.connection.clone();
        let _: () = conn
            .hset_multiple(self.reconcile_key(), &fields)
            .await
            .map_err(map_redis)?;
        Ok(())
    }

    async fn pending_reconcile(&self, limit: usize) -> Result<Vec<ReconcileEntry>, StorageError> {
        let key = self.reconcile_key();
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn.hvals(&key).await.map_err(map_redis)?;
        let mut entries = raw
            .iter()
            .map(|s| decode::<ReconcileEntry>(&key, s))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| (e.enqueued_at, e.event_id));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn ack_reconcile(&self, event_ids: &[EventId]) -> Result<(), StorageError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = conn.hdel(self.reconcile_key(), event_ids).await.map_err(map_redis)?;
        Ok(())
    }

    async fn reconcile_len(&self) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let len: u64 = conn.hlen(self.reconcile_key()).await.map_err(map_redis)?;
        Ok(len)
    }
}
