use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::event_record::{ChannelId, EventId, EventRecord};
use crate::interval::{TimeRange, HOUR_MILLIS};
use crate::resilience::reconcile::ReconcileEntry;
use crate::sync_state::{ChannelCoverage, Checkpoint, SyncStatus};

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// The store refused this one record. A data error, not a store outage.
    #[error("Record {event_id} rejected: {reason}")]
    InvalidRecord { event_id: EventId, reason: String },
    /// The store could not be reached at all.
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt data for '{key}': {reason}")]
    Corruption { key: String, reason: String },
}

impl StorageError {
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    #[must_use]
    pub fn is_invalid_record(&self) -> bool {
        matches!(self, Self::InvalidRecord { .. })
    }
}

/// Result of a batch write operation with verification
#[derive(Debug)]
pub struct BatchWriteResult {
    /// Unique batch ID for this write (audit trail)
    pub batch_id: String,
    /// Number of records written
    pub written: usize,
    /// Whether the write was verified (SQL reads back the IDs; Redis is always true)
    pub verified: bool,
}

/// An archive store for event records.
///
/// Every write is an upsert keyed by `event_id`: writing the same record
/// any number of times leaves exactly one copy holding the latest content.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &str;

    async fn upsert(&self, record: &EventRecord) -> Result<(), StorageError>;

    /// Write a batch. Either the whole batch lands or an error is returned;
    /// callers fall back to per-record writes to isolate a bad record.
    /// Default implementation falls back to sequential upserts.
    async fn upsert_batch(&self, records: &[EventRecord]) -> Result<BatchWriteResult, StorageError> {
        for record in records {
            self.upsert(record).await?;
        }
        Ok(BatchWriteResult {
            batch_id: String::new(),
            written: records.len(),
            verified: true,
        })
    }

    async fn get(&self, event_id: EventId) -> Result<Option<EventRecord>, StorageError>;

    /// Records of a channel created inside `range`, ascending by `event_id`.
    async fn range(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError>;

    async fn count_range(&self, channel_id: ChannelId, range: TimeRange) -> Result<u64, StorageError>;

    /// Record counts per hour bucket (keyed by the bucket's start, epoch ms).
    /// Hours with no records are absent.
    async fn hourly_counts(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
    ) -> Result<BTreeMap<i64, u64>, StorageError> {
        let records = self.range(channel_id, range, usize::MAX).await?;
        Ok(bucket_by_hour(records.iter().map(|r| r.created_at)))
    }

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// Durable bookkeeping: coverage, sync status, checkpoints and the
/// reconciliation queue. Lives alongside the primary store.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_coverage(&self, channel_id: ChannelId) -> Result<Option<ChannelCoverage>, StorageError>;
    async fn save_coverage(&self, coverage: &ChannelCoverage) -> Result<(), StorageError>;

    async fn load_status(&self, entity_name: &str) -> Result<Option<SyncStatus>, StorageError>;
    async fn save_status(&self, status: &SyncStatus) -> Result<(), StorageError>;

    async fn load_checkpoint(&self, key: &str) -> Result<Option<Checkpoint>, StorageError>;
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;
    async fn clear_checkpoint(&self, key: &str) -> Result<(), StorageError>;

    /// Insert or replace entries, keyed by `event_id`.
    async fn enqueue_reconcile(&self, entries: &[ReconcileEntry]) -> Result<(), StorageError>;
    /// Oldest entries first.
    async fn pending_reconcile(&self, limit: usize) -> Result<Vec<ReconcileEntry>, StorageError>;
    async fn ack_reconcile(&self, event_ids: &[EventId]) -> Result<(), StorageError>;
    async fn reconcile_len(&self) -> Result<u64, StorageError>;
}

/// Hour bucket start for an epoch-ms timestamp.
#[must_use]
pub fn hour_bucket(ts_millis: i64) -> i64 {
    ts_millis.div_euclid(HOUR_MILLIS) * HOUR_MILLIS
}

pub fn bucket_by_hour(timestamps: impl IntoIterator<Item = i64>) -> BTreeMap<i64, u64> {
    let mut buckets = BTreeMap::new();
    for ts in timestamps {
        *buckets.entry(hour_bucket(ts)).or_insert(0) += 1;
    }
    buckets
}
