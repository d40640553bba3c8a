// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent writes into one or both archive stores.
//!
//! ```text
//!            records
//!               │ validate (bad records fail here, stores never see them)
//!               ▼
//!   ┌──── lead store ────┐   batch upsert, per-record fallback on failure
//!   │ primary | secondary │
//!   └─────────┬──────────┘
//!             │ policy = both: only what landed in the primary
//!             ▼
//!       secondary store ──── failed? ──► reconcile queue (partial)
//! ```
//!
//! Every call goes through the store's rate limiter bucket and circuit
//! breaker. A batch that fails for any reason other than an outage is
//! retried record by record, so one poison record costs only itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event_record::{ChannelId, EventId, EventRecord};
use crate::metrics::LatencyTimer;
use crate::rate_limiter::RateLimiter;
use crate::resilience::circuit_breaker::{CircuitBreaker, StoreCircuits};
use crate::resilience::reconcile::ReconcileQueue;
use crate::storage::traits::{EventStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    PrimaryOnly,
    SecondaryOnly,
    #[default]
    Both,
}

impl WritePolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryOnly => "primary_only",
            Self::SecondaryOnly => "secondary_only",
            Self::Both => "both",
        }
    }

    /// The store whose success decides whether a record counts as written.
    #[must_use]
    pub fn lead(&self) -> StoreRole {
        match self {
            Self::SecondaryOnly => StoreRole::Secondary,
            _ => StoreRole::Primary,
        }
    }

    #[must_use]
    pub fn targets(&self) -> &'static [StoreRole] {
        match self {
            Self::PrimaryOnly => &[StoreRole::Primary],
            Self::SecondaryOnly => &[StoreRole::Secondary],
            Self::Both => &[StoreRole::Primary, StoreRole::Secondary],
        }
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreRole {
    Primary,
    Secondary,
}

impl StoreRole {
    /// Also the rate limiter key for the store.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Landed everywhere the policy asked.
    Success,
    /// Landed in the lead store; some secondary copies are queued for repair.
    Partial,
    /// Nothing landed.
    Failure,
}

impl WriteOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The record itself is bad. Retrying won't help.
    Data,
    /// The store failed. A later pass may succeed.
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub event_id: EventId,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Landed in the lead store.
    pub written: Vec<EventId>,
    /// Subset of `written` that missed the secondary and was queued.
    pub partial: Vec<EventId>,
    pub failed: Vec<RecordFailure>,
    /// Set if queueing `partial` for repair itself failed.
    pub reconcile_error: Option<String>,
}

impl BatchOutcome {
    #[must_use]
    pub fn outcome(&self) -> WriteOutcome {
        if self.written.is_empty() {
            WriteOutcome::Failure
        } else if self.partial.is_empty() && self.failed.is_empty() {
            WriteOutcome::Success
        } else {
            WriteOutcome::Partial
        }
    }

    pub fn data_errors(&self) -> impl Iterator<Item = &RecordFailure> {
        self.failed.iter().filter(|f| f.kind == FailureKind::Data)
    }

    pub fn store_errors(&self) -> impl Iterator<Item = &RecordFailure> {
        self.failed.iter().filter(|f| f.kind == FailureKind::Store)
    }

    #[must_use]
    pub fn has_store_errors(&self) -> bool {
        self.store_errors().next().is_some()
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write policy '{policy}' needs the {role} store, which is not configured")]
    NotConfigured { policy: WritePolicy, role: &'static str },
    #[error("{role} store unavailable: {reason}")]
    StoreUnavailable { role: &'static str, reason: String },
}

/// What one store did with a set of records.
#[derive(Default)]
struct StoreResult {
    landed: Vec<usize>,
    failed: Vec<(usize, FailureKind, String)>,
    /// Set when every failure was an outage (nothing was judged on its merits).
    outage: Option<String>,
}

pub struct DualStoreWriter {
    primary: Arc<dyn EventStore>,
    secondary: Option<Arc<dyn EventStore>>,
    circuits: StoreCircuits,
    limiter: Arc<RateLimiter>,
    reconcile: Arc<ReconcileQueue>,
    batch_size: usize,
}

impl DualStoreWriter {
    pub fn new(
        primary: Arc<dyn EventStore>,
        secondary: Option<Arc<dyn EventStore>>,
        circuits: StoreCircuits,
        limiter: Arc<RateLimiter>,
        reconcile: Arc<ReconcileQueue>,
        batch_size: usize,
    ) -> Self {
        Self {
            primary,
            secondary,
            circuits,
            limiter,
            reconcile,
            batch_size: batch_size.max(1),
        }
    }

    #[must_use]
    pub fn primary(&self) -> &Arc<dyn EventStore> {
        &self.primary
    }

    #[must_use]
    pub fn secondary(&self) -> Option<&Arc<dyn EventStore>> {
        self.secondary.as_ref()
    }

    #[must_use]
    pub fn circuits(&self) -> &StoreCircuits {
        &self.circuits
    }

    #[must_use]
    pub fn reconcile(&self) -> &Arc<ReconcileQueue> {
        &self.reconcile
    }

    fn store(&self, role: StoreRole) -> Option<(&Arc<dyn EventStore>, &CircuitBreaker)> {
        match role {
            StoreRole::Primary => Some((&self.primary, &self.circuits.primary)),
            StoreRole::Secondary => self.secondary.as_ref().map(|s| (s, &self.circuits.secondary)),
        }
    }

    pub async fn write(&self, record: &EventRecord, policy: WritePolicy) -> Result<WriteOutcome, WriteError> {
        let outcome = self.write_batch(std::slice::from_ref(record), policy).await?;
        Ok(outcome.outcome())
    }

    /// Upsert `records` according to `policy`.
    ///
    /// Returns `Err` only when the lead store is down outright or missing;
    /// everything else is reported per record in the [`BatchOutcome`].
    pub async fn write_batch(
        &self,
        records: &[EventRecord],
        policy: WritePolicy,
    ) -> Result<BatchOutcome, WriteError> {
        for role in policy.targets() {
            if self.store(*role).is_none() {
                return Err(WriteError::NotConfigured {
                    policy,
                    role: role.as_str(),
                });
            }
        }

        let mut outcome = BatchOutcome::default();
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match record.validate() {
                Ok(()) => valid.push(record.clone()),
                Err(e) => outcome.failed.push(RecordFailure {
                    event_id: record.event_id,
                    kind: FailureKind::Data,
                    reason: e.to_string(),
                }),
            }
        }
        if !outcome.failed.is_empty() {
            crate::metrics::record_records_rejected("validate", outcome.failed.len());
        }
        if valid.is_empty() {
            return Ok(outcome);
        }

        let lead = policy.lead();
        let lead_result = self.write_to(lead, &valid).await;
        if lead_result.landed.is_empty() {
            if let Some(reason) = lead_result.outage {
                return Err(WriteError::StoreUnavailable {
                    role: lead.as_str(),
                    reason,
                });
            }
        }
        for (i, kind, reason) in lead_result.failed {
            outcome.failed.push(RecordFailure {
                event_id: valid[i].event_id,
                kind,
                reason,
            });
        }
        outcome.written = lead_result.landed.iter().map(|&i| valid[i].event_id).collect();

        if policy == WritePolicy::Both && !lead_result.landed.is_empty() {
            let landed: Vec<EventRecord> = lead_result.landed.iter().map(|&i| valid[i].clone()).collect();
            let secondary_result = self.write_to(StoreRole::Secondary, &landed).await;
            if !secondary_result.failed.is_empty() {
                let missed: Vec<(EventId, ChannelId)> = secondary_result
                    .failed
                    .iter()
                    .map(|(i, _, _)| (landed[*i].event_id, landed[*i].channel_id))
                    .collect();
                let reason = secondary_result.failed[0].2.clone();
                warn!(
                    count = missed.len(),
                    reason = %reason,
                    "Secondary write failed, queueing for reconciliation"
                );
                if let Err(e) = self.reconcile.enqueue(&missed, &reason).await {
                    warn!(error = %e, "Failed to queue records for reconciliation");
                    outcome.reconcile_error = Some(e.to_string());
                }
                outcome.partial = missed.into_iter().map(|(id, _)| id).collect();
            }
        }

        debug!(
            policy = %policy,
            written = outcome.written.len(),
            partial = outcome.partial.len(),
            failed = outcome.failed.len(),
            "Batch written"
        );
        Ok(outcome)
    }

    async fn write_to(&self, role: StoreRole, records: &[EventRecord]) -> StoreResult {
        let mut result = StoreResult::default();
        let Some((store, circuit)) = self.store(role) else {
            return result;
        };

        let mut outage_only = true;
        for (chunk_no, chunk) in records.chunks(self.batch_size).enumerate() {
            let offset = chunk_no * self.batch_size;
            self.limiter.acquire(role.as_str()).await;
            let batch = {
                let _timer = LatencyTimer::new(store.name(), "upsert_batch");
                circuit.call(|| store.upsert_batch(chunk)).await
            };

            let err = match batch {
                Ok(r) => {
                    result.landed.extend(offset..offset + chunk.len());
                    crate::metrics::record_store_write(store.name(), "success", r.written);
                    continue;
                }
                Err(e) => e,
            };

            if err.is_unavailable() {
                crate::metrics::record_store_error(store.name(), "upsert_batch", "unavailable");
                crate::metrics::record_store_write(store.name(), "failure", chunk.len());
                let reason = err.to_string();
                result.outage = Some(reason.clone());
                result
                    .failed
                    .extend((offset..offset + chunk.len()).map(|i| (i, FailureKind::Store, reason.clone())));
                continue;
            }

            debug!(store = store.name(), error = %err, "Batch failed, retrying record by record");
            crate::metrics::record_store_error(store.name(), "upsert_batch", "batch_failed");
            for (j, record) in chunk.iter().enumerate() {
                match self.write_one(role, store, circuit, record).await {
                    Ok(()) => result.landed.push(offset + j),
                    Err(e) => {
                        let kind = if e.is_invalid_record() { FailureKind::Data } else { FailureKind::Store };
                        if !e.is_unavailable() {
                            outage_only = false;
                        } else {
                            result.outage = Some(e.to_string());
                        }
                        if kind == FailureKind::Data {
                            warn!(store = store.name(), event_id = record.event_id, error = %e, "Skipping rejected record");
                            crate::metrics::record_records_rejected(store.name(), 1);
                        }
                        result.failed.push((offset + j, kind, e.to_string()));
                    }
                }
            }
        }

        if !outage_only {
            result.outage = None;
        }
        result
    }

    async fn write_one(
        &self,
        role: StoreRole,
        store: &Arc<dyn EventStore>,
        circuit: &CircuitBreaker,
        record: &EventRecord,
    ) -> Result<(), StorageError> {
        self.limiter.acquire(role.as_str()).await;
        let result = circuit.call(|| store.upsert(record)).await;
        let status = if result.is_ok() { "success" } else { "failure" };
        crate::metrics::record_store_write(store.name(), status, 1);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event_record::Attachment;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::BatchWriteResult;
    use crate::interval::TimeRange;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Store that can be switched off, and that refuses event 13 on its own.
    struct Flaky {
        inner: InMemoryStore,
        down: AtomicBool,
    }

    impl Flaky {
        fn new(name: &str) -> Self {
            Self { inner: InMemoryStore::named(name), down: AtomicBool::new(false) }
        }
        fn check(&self) -> Result<(), StorageError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StorageError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl EventStore for Flaky {
        fn name(&self) -> &str {
            self.inner.name()
        }
        async fn upsert(&self, record: &EventRecord) -> Result<(), StorageError> {
            self.check()?;
            if record.event_id == 13 {
                return Err(StorageError::InvalidRecord { event_id: 13, reason: "unlucky".into() });
            }
            self.inner.upsert(record).await
        }
        async fn upsert_batch(&self, records: &[EventRecord]) -> Result<BatchWriteResult, StorageError> {
            self.check()?;
            if records.iter().any(|r| r.event_id == 13) {
                return Err(StorageError::Backend("constraint violation in batch".into()));
            }
            self.inner.upsert_batch(records).await
        }
        async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StorageError> {
            self.check()?;
            self.inner.get(id).await
        }
        async fn range(&self, c: ChannelId, r: TimeRange, l: usize) -> Result<Vec<EventRecord>, StorageError> {
            self.inner.range(c, r, l).await
        }
        async fn count_range(&self, c: ChannelId, r: TimeRange) -> Result<u64, StorageError> {
            self.inner.count_range(c, r).await
        }
        async fn hourly_counts(&self, c: ChannelId, r: TimeRange) -> Result<BTreeMap<i64, u64>, StorageError> {
            self.inner.hourly_counts(c, r).await
        }
        async fn ping(&self) -> Result<(), StorageError> {
            self.check()
        }
    }

    struct Fixture {
        writer: DualStoreWriter,
        primary: Arc<Flaky>,
        secondary: Arc<Flaky>,
        queue: Arc<ReconcileQueue>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let primary = Arc::new(Flaky::new("primary"));
        let secondary = Arc::new(Flaky::new("secondary"));
        let queue = Arc::new(ReconcileQueue::new(Arc::new(InMemoryStore::new()), clock.clone()));
        let limiter = Arc::new(RateLimiter::new(clock, Duration::from_secs(30)));
        let writer = DualStoreWriter::new(
            primary.clone(),
            Some(secondary.clone()),
            StoreCircuits::with_config(CircuitConfig::test()),
            limiter,
            queue.clone(),
            10,
        );
        Fixture { writer, primary, secondary, queue }
    }

    fn records(ids: impl IntoIterator<Item = u64>) -> Vec<EventRecord> {
        ids.into_iter()
            .map(|id| EventRecord::new(id, 1, 1, id as i64 * 1000).with_content(format!("m{id}")))
            .collect()
    }

    #[tokio::test]
    async fn test_both_policy_writes_both_stores() {
        let f = fixture();
        let out = f.writer.write_batch(&records(1..=5), WritePolicy::Both).await.unwrap();

        assert_eq!(out.outcome(), WriteOutcome::Success);
        assert_eq!(out.written, vec![1, 2, 3, 4, 5]);
        assert_eq!(f.primary.inner.len(), 5);
        assert_eq!(f.secondary.inner.len(), 5);
    }

    #[tokio::test]
    async fn test_repeated_writes_are_idempotent() {
        let f = fixture();
        let batch = records(1..=3);
        for _ in 0..4 {
            f.writer.write_batch(&batch, WritePolicy::Both).await.unwrap();
        }
        assert_eq!(f.primary.inner.len(), 3);
        assert_eq!(f.primary.inner.get(2).await.unwrap(), Some(batch[1].clone()));
    }

    #[tokio::test]
    async fn test_single_policy_touches_one_store() {
        let f = fixture();
        f.writer.write_batch(&records(1..=2), WritePolicy::PrimaryOnly).await.unwrap();
        f.writer.write_batch(&records(3..=4), WritePolicy::SecondaryOnly).await.unwrap();

        assert_eq!(f.primary.inner.len(), 2);
        assert_eq!(f.secondary.inner.len(), 2);
        assert!(f.secondary.inner.get(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_secondary_down_is_partial_and_queued() {
        let f = fixture();
        f.secondary.down.store(true, Ordering::SeqCst);

        let record = &records([7])[0];
        let outcome = f.writer.write(record, WritePolicy::Both).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Partial);
        assert_eq!(f.primary.inner.get(7).await.unwrap().as_ref(), Some(record));
        let pending = f.queue.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, 7);
        assert_eq!(pending[0].channel_id, 1);
    }

    #[tokio::test]
    async fn test_primary_down_is_an_error_under_both() {
        let f = fixture();
        f.primary.down.store(true, Ordering::SeqCst);

        let err = f.writer.write_batch(&records(1..=3), WritePolicy::Both).await.unwrap_err();
        assert!(matches!(err, WriteError::StoreUnavailable { role: "primary", .. }));
        // Never fell through to the secondary.
        assert!(f.secondary.inner.is_empty());
    }

    #[tokio::test]
    async fn test_poison_record_is_isolated() {
        let f = fixture();
        let out = f.writer.write_batch(&records(10..=16), WritePolicy::Both).await.unwrap();

        assert_eq!(out.outcome(), WriteOutcome::Partial);
        assert_eq!(out.written, vec![10, 11, 12, 14, 15, 16]);
        let bad: Vec<_> = out.data_errors().map(|e| e.event_id).collect();
        assert_eq!(bad, vec![13]);
        assert!(!out.has_store_errors());
        assert_eq!(f.secondary.inner.len(), 6);
        // Rejections aren't outages; the breaker saw none.
        assert_eq!(f.writer.circuits().primary.outages(), 0);
    }

    #[tokio::test]
    async fn test_invalid_records_never_reach_stores() {
        let f = fixture();
        let mut batch = records(1..=3);
        batch[1] = batch[1].clone().with_attachment(Attachment {
            url: String::new(),
            filename: "a.png".into(),
            content_type: None,
            size: None,
        });

        let out = f.writer.write_batch(&batch, WritePolicy::Both).await.unwrap();
        assert_eq!(out.written, vec![1, 3]);
        assert_eq!(out.data_errors().count(), 1);
        assert_eq!(f.primary.inner.write_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_secondary_is_not_configured() {
        let clock = Arc::new(ManualClock::new(0));
        let queue = Arc::new(ReconcileQueue::new(Arc::new(InMemoryStore::new()), clock.clone()));
        let writer = DualStoreWriter::new(
            Arc::new(InMemoryStore::new()),
            None,
            StoreCircuits::new(),
            Arc::new(RateLimiter::new(clock, Duration::from_secs(30))),
            queue,
            10,
        );
        let err = writer.write_batch(&records([1]), WritePolicy::Both).await.unwrap_err();
        assert!(matches!(err, WriteError::NotConfigured { role: "secondary", .. }));
        assert!(writer.write_batch(&records([1]), WritePolicy::PrimaryOnly).await.is_ok());
    }
}
