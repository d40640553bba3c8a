// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-store parity check.
//!
//! Reads one channel range from both stores and compares records by
//! content hash. Anything the secondary lacks or holds stale is queued for
//! reconciliation; records only the secondary has are reported but left
//! alone (the primary is authoritative, not exhaustive).

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::event_record::{ChannelId, EventId};
use crate::interval::TimeRange;
use crate::resilience::reconcile::ReconcileQueue;
use crate::storage::traits::{EventStore, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParityReport {
    pub channel_id: ChannelId,
    pub range: TimeRange,
    /// Records compared on the primary side.
    pub checked: usize,
    /// In the primary, absent from the secondary.
    pub missing: Vec<EventId>,
    /// In both, with differing content.
    pub mismatched: Vec<EventId>,
    /// In the secondary only.
    pub extra: Vec<EventId>,
}

impl ParityReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.extra.is_empty()
    }
}

pub struct ParityChecker {
    primary: Arc<dyn EventStore>,
    secondary: Arc<dyn EventStore>,
    reconcile: Arc<ReconcileQueue>,
}

impl ParityChecker {
    pub fn new(
        primary: Arc<dyn EventStore>,
        secondary: Arc<dyn EventStore>,
        reconcile: Arc<ReconcileQueue>,
    ) -> Self {
        Self {
            primary,
            secondary,
            reconcile,
        }
    }

    /// Compare up to `limit` records per store over `range`, queueing repairs.
    #[instrument(skip(self))]
    pub async fn check(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        limit: usize,
    ) -> Result<ParityReport, StorageError> {
        let primary = self.primary.range(channel_id, range, limit).await?;
        let mut secondary: HashMap<EventId, String> = self
            .secondary
            .range(channel_id, range, limit)
            .await?
            .into_iter()
            .map(|r| (r.event_id, r.content_hash()))
            .collect();

        let mut report = ParityReport {
            channel_id,
            range,
            checked: primary.len(),
            ..Default::default()
        };
        for record in &primary {
            match secondary.remove(&record.event_id) {
                None => report.missing.push(record.event_id),
                Some(hash) if hash != record.content_hash() => report.mismatched.push(record.event_id),
                Some(_) => {}
            }
        }
        report.extra = secondary.into_keys().collect();
        report.extra.sort_unstable();

        let repairs: Vec<(EventId, ChannelId)> = report
            .missing
            .iter()
            .chain(&report.mismatched)
            .map(|&id| (id, channel_id))
            .collect();
        self.reconcile.enqueue(&repairs, "parity check").await?;

        crate::metrics::record_parity_mismatch("missing", report.missing.len());
        crate::metrics::record_parity_mismatch("mismatched", report.mismatched.len());
        crate::metrics::record_parity_mismatch("extra", report.extra.len());
        info!(
            channel_id,
            %range,
            checked = report.checked,
            missing = report.missing.len(),
            mismatched = report.mismatched.len(),
            extra = report.extra.len(),
            "Parity check complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event_record::EventRecord;
    use crate::storage::memory::InMemoryStore;

    #[tokio::test]
    async fn test_parity_finds_and_queues_differences() {
        let primary = Arc::new(InMemoryStore::named("primary"));
        let secondary = Arc::new(InMemoryStore::named("secondary"));
        let queue = Arc::new(ReconcileQueue::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(0)),
        ));

        for id in 1..=4 {
            primary.upsert(&EventRecord::new(id, 9, 1, id as i64).with_content("same")).await.unwrap();
        }
        secondary.upsert(&EventRecord::new(1, 9, 1, 1).with_content("same")).await.unwrap();
        secondary.upsert(&EventRecord::new(2, 9, 1, 2).with_content("stale")).await.unwrap();
        secondary.upsert(&EventRecord::new(4, 9, 1, 4).with_content("same")).await.unwrap();
        secondary.upsert(&EventRecord::new(5, 9, 1, 5)).await.unwrap();

        let checker = ParityChecker::new(primary.clone(), secondary.clone(), queue.clone());
        let report = checker.check(9, TimeRange::new(0, 100), 1000).await.unwrap();

        assert_eq!(report.checked, 4);
        assert_eq!(report.missing, vec![3]);
        assert_eq!(report.mismatched, vec![2]);
        assert_eq!(report.extra, vec![5]);
        assert!(!report.is_consistent());

        // Draining the queue brings the secondary back in line.
        queue.drain(primary.as_ref(), secondary.as_ref(), 100).await.unwrap();
        let again = checker.check(9, TimeRange::new(0, 5), 1000).await.unwrap();
        assert!(again.missing.is_empty() && again.mismatched.is_empty());
    }
}
