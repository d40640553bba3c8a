use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::traits::{BatchWriteResult, EventStore, StateStore, StorageError};
use crate::event_record::{ChannelId, EventId, EventRecord};
use crate::interval::TimeRange;
use crate::resilience::reconcile::ReconcileEntry;
use crate::sync_state::{ChannelCoverage, Checkpoint, SyncStatus};

/// Event and state store held entirely in memory.
///
/// Used in tests and for dry runs. Behaves like the persistent stores:
/// upserts by `event_id`, validates records, all-or-nothing batches.
pub struct InMemoryStore {
    name: String,
    events: DashMap<EventId, EventRecord>,
    coverage: DashMap<ChannelId, ChannelCoverage>,
    status: DashMap<String, SyncStatus>,
    checkpoints: DashMap<String, Checkpoint>,
    reconcile: DashMap<EventId, ReconcileEntry>,
    writes: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: DashMap::new(),
            coverage: DashMap::new(),
            status: DashMap::new(),
            checkpoints: DashMap::new(),
            reconcile: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of distinct records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total record writes accepted, including overwrites
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Drop a record, simulating loss in this store.
    pub fn remove(&self, event_id: EventId) -> Option<EventRecord> {
        self.events.remove(&event_id).map(|(_, r)| r)
    }

    pub fn clear(&self) {
        self.events.clear();
    }

    fn check(record: &EventRecord) -> Result<(), StorageError> {
        record.validate().map_err(|e| StorageError::InvalidRecord {
            event_id: record.event_id,
            reason: e.to_string(),
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, record: &EventRecord) -> Result<(), StorageError> {
        Self::check(record)?;
        self.events.insert(record.event_id, record.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn upsert_batch(&self, records: &[EventRecord]) -> Result<BatchWriteResult, StorageError> {
        for record in records {
            Self::check(record)?;
        }
        for record in records {
            self.events.insert(record.event_id, record.clone());
        }
        self.writes.fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(BatchWriteResult {
            batch_id: uuid::Uuid::new_v4().to_string(),
            written: records.len(),
            verified: true,
        })
    }

    async fn get(&self, event_id: EventId) -> Result<Option<EventRecord>, StorageError> {
        Ok(self.events.get(&event_id).map(|r| r.value().clone()))
    }

    async fn range(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let mut out: Vec<EventRecord> = self
            .events
            .iter()
            .filter(|r| r.channel_id == channel_id && range.contains(r.created_at))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.event_id);
        out.truncate(limit);
        Ok(out)
    }

    async fn count_range(&self, channel_id: ChannelId, range: TimeRange) -> Result<u64, StorageError> {
        Ok(self
            .events
            .iter()
            .filter(|r| r.channel_id == channel_id && range.contains(r.created_at))
            .count() as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn load_coverage(&self, channel_id: ChannelId) -> Result<Option<ChannelCoverage>, StorageError> {
        Ok(self.coverage.get(&channel_id).map(|c| c.value().clone()))
    }

    async fn save_coverage(&self, coverage: &ChannelCoverage) -> Result<(), StorageError> {
        self.coverage.insert(coverage.channel_id, coverage.clone());
        Ok(())
    }

    async fn load_status(&self, entity_name: &str) -> Result<Option<SyncStatus>, StorageError> {
        Ok(self.status.get(entity_name).map(|s| s.value().clone()))
    }

    async fn save_status(&self, status: &SyncStatus) -> Result<(), StorageError> {
        self.status.insert(status.entity_name.clone(), status.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, key: &str) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.checkpoints.get(key).map(|c| c.value().clone()))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.checkpoints.insert(checkpoint.key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn clear_checkpoint(&self, key: &str) -> Result<(), StorageError> {
        self.checkpoints.remove(key);
        Ok(())
    }

    async fn enqueue_reconcile(&self, entries: &[ReconcileEntry]) -> Result<(), StorageError> {
        for entry in entries {
            self.reconcile.insert(entry.event_id, entry.clone());
        }
        Ok(())
    }

    async fn pending_reconcile(&self, limit: usize) -> Result<Vec<ReconcileEntry>, StorageError> {
        let mut entries: Vec<ReconcileEntry> = self.reconcile.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| (e.enqueued_at, e.event_id));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn ack_reconcile(&self, event_ids: &[EventId]) -> Result<(), StorageError> {
        for id in event_ids {
            self.reconcile.remove(id);
        }
        Ok(())
    }

    async fn reconcile_len(&self) -> Result<u64, StorageError> {
        Ok(self.reconcile.len() as u64)
    }
}
