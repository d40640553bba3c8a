// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation queue for records the secondary store is missing.
//!
//! When a dual write lands in the primary but not the secondary, the event
//! ID is queued here instead of failing the work unit. A drain later reads
//! each queued record back from the primary and upserts it into the
//! secondary. The queue is durable (it lives in the [`StateStore`]) so
//! entries survive restarts.
//!
//! This is NOT a store - it's a to-do list. Record content always comes
//! from the primary at drain time, so the latest version wins.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::event_record::{ChannelId, EventId};
use crate::storage::traits::{EventStore, StateStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileEntry {
    pub event_id: EventId,
    pub channel_id: ChannelId,
    pub enqueued_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Queue state for observability
#[derive(Debug, Clone, Copy)]
pub struct ReconcileStats {
    /// Entries waiting, as last observed
    pub pending: u64,
    /// Total entries enqueued since startup
    pub total_enqueued: u64,
    /// Total records repaired since startup
    pub total_repaired: u64,
    /// Whether a drain is in progress
    pub draining: bool,
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Copied into the secondary and removed from the queue
    pub repaired: Vec<EventId>,
    /// Not in the primary either; nothing to copy, removed from the queue
    pub dropped: Vec<EventId>,
    /// Still failing; left queued with a bumped attempt count
    pub failed: Vec<EventId>,
}

impl DrainReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.repaired.is_empty() && self.dropped.is_empty() && self.failed.is_empty()
    }
}

pub struct ReconcileQueue {
    state: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    pending: AtomicU64,
    total_enqueued: AtomicU64,
    total_repaired: AtomicU64,
    draining: AtomicBool,
}

impl ReconcileQueue {
    pub fn new(state: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state,
            clock,
            pending: AtomicU64::new(0),
            total_enqueued: AtomicU64::new(0),
            total_repaired: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// Queue records for repair. Re-queueing an ID replaces its entry.
    pub async fn enqueue(
        &self,
        records: &[(EventId, ChannelId)],
        reason: &str,
    ) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let now = self.clock.wall_millis();
        let entries: Vec<ReconcileEntry> = records
            .iter()
            .map(|&(event_id, channel_id)| ReconcileEntry {
                event_id,
                channel_id,
                enqueued_at: now,
                attempts: 0,
                last_error: Some(reason.to_string()),
            })
            .collect();

        self.state.enqueue_reconcile(&entries).await?;
        self.total_enqueued.fetch_add(entries.len() as u64, Ordering::Relaxed);
        self.refresh_pending().await;

        debug!(count = entries.len(), reason, "Queued records for reconciliation");
        Ok(())
    }

    pub async fn len(&self) -> Result<u64, StorageError> {
        self.state.reconcile_len().await
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    pub async fn pending(&self, limit: usize) -> Result<Vec<ReconcileEntry>, StorageError> {
        self.state.pending_reconcile(limit).await
    }

    async fn refresh_pending(&self) {
        match self.state.reconcile_len().await {
            Ok(n) => {
                self.pending.store(n, Ordering::Release);
                crate::metrics::set_reconcile_pending(n);
            }
            Err(e) => debug!(error = %e, "Could not read reconcile queue length"),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ReconcileStats {
        ReconcileStats {
            pending: self.pending.load(Ordering::Acquire),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_repaired: self.total_repaired.load(Ordering::Relaxed),
            draining: self.draining.load(Ordering::Acquire),
        }
    }

    /// Repair up to `batch_size` queued records by copying them from
    /// `primary` to `secondary`.
    ///
    /// Returns an error only when the queue itself can't be read or
    /// updated. Per-record failures stay queued and are reported.
    pub async fn drain(
        &self,
        primary: &dyn EventStore,
        secondary: &dyn EventStore,
        batch_size: usize,
    ) -> Result<DrainReport, StorageError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            // Already draining
            return Ok(DrainReport::default());
        }
        let _guard = DrainGuard(&self.draining);

        let entries = self.state.pending_reconcile(batch_size).await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }
        info!(batch = entries.len(), "Starting reconciliation drain");

        let mut report = DrainReport::default();
        let mut retry_later = Vec::new();

        for entry in entries {
            let outcome = match primary.get(entry.event_id).await {
                Ok(Some(record)) => secondary.upsert(&record).await.map(|_| true),
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(true) => report.repaired.push(entry.event_id),
                Ok(false) => {
                    warn!(event_id = entry.event_id, "Queued record missing from primary, dropping");
                    report.dropped.push(entry.event_id);
                }
                Err(e) => {
                    debug!(event_id = entry.event_id, error = %e, "Reconciliation attempt failed");
                    report.failed.push(entry.event_id);
                    retry_later.push(ReconcileEntry {
                        attempts: entry.attempts + 1,
                        last_error: Some(e.to_string()),
                        ..entry
                    });
                }
            }
        }

        let done: Vec<EventId> = report.repaired.iter().chain(&report.dropped).copied().collect();
        self.state.ack_reconcile(&done).await?;
        self.state.enqueue_reconcile(&retry_later).await?;

        self.total_repaired
            .fetch_add(report.repaired.len() as u64, Ordering::Relaxed);
        crate::metrics::record_reconcile_drain(report.repaired.len(), report.failed.is_empty());
        self.refresh_pending().await;

        info!(
            repaired = report.repaired.len(),
            dropped = report.dropped.len(),
            failed = report.failed.len(),
            "Reconciliation drain complete"
        );
        Ok(report)
    }
}

/// RAII guard to reset draining flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
