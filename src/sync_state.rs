// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable sync bookkeeping.
//!
//! Three kinds of state survive restarts:
//!
//! - **Coverage** ([`ChannelCoverage`]): per channel, the set of time ranges
//!   known to be fully archived. It only ever grows.
//! - **Status** ([`SyncStatus`]): per entity, the outcome of the latest pass.
//!   `pending → running → {succeeded | failed}`, with a heartbeat so a
//!   crashed run can be taken over once it goes stale.
//! - **Checkpoints** ([`Checkpoint`]): per in-flight work unit, the last
//!   cursor whose page was durably written, so a restart resumes there.
//!
//! All mutation goes through [`SyncStateTracker`], which serializes
//! read-modify-write cycles per key.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::event_record::{ChannelId, EventId};
use crate::interval::{IntervalSet, TimeRange};
use crate::source::Direction;
use crate::storage::traits::{StateStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SyncState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub entity_name: String,
    /// Heartbeat: epoch ms of the last status write.
    pub last_sync_timestamp: i64,
    pub records_synced: u64,
    pub status: SyncState,
    pub error_message: Option<String>,
}

impl SyncStatus {
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            last_sync_timestamp: 0,
            records_synced: 0,
            status: SyncState::Pending,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCoverage {
    pub channel_id: ChannelId,
    pub complete: IntervalSet,
    pub last_verified_at: Option<i64>,
}

impl ChannelCoverage {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            complete: IntervalSet::new(),
            last_verified_at: None,
        }
    }
}

/// Resume point for one work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: String,
    pub channel_id: ChannelId,
    pub range: TimeRange,
    /// Crawl direction the cursor belongs to.
    pub direction: Direction,
    /// Last event ID whose page was fully written.
    pub cursor: EventId,
    pub records_written: u64,
    pub updated_at: i64,
}

/// Stable key for a channel's status row.
#[must_use]
pub fn channel_entity(channel_id: ChannelId) -> String {
    format!("channel:{channel_id}")
}

/// Key for a work unit's checkpoint.
///
/// Only the start is part of the key. The newest unit's end follows the
/// wall clock, so it differs on every run while its start stays put.
#[must_use]
pub fn checkpoint_key(channel_id: ChannelId, range: &TimeRange) -> String {
    format!("{}:{}", channel_id, range.start)
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("sync for '{entity}' is already running (last heartbeat {age_secs}s ago)")]
    AlreadyRunning { entity: String, age_secs: i64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-key async locks for read-modify-write cycles.
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    fn get(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct SyncStateTracker {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    max_run_duration: Duration,
    locks: KeyedLocks,
}

impl SyncStateTracker {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, max_run_duration: Duration) -> Self {
        Self {
            store,
            clock,
            max_run_duration,
            locks: KeyedLocks::default(),
        }
    }

    async fn update_status<F>(&self, entity: &str, mutate: F) -> Result<SyncStatus, StateError>
    where
        F: FnOnce(&mut SyncStatus, i64) -> Result<(), StateError> + Send,
    {
        let lock = self.locks.get(&format!("status:{entity}"));
        let _guard = lock.lock().await;

        let now = self.clock.wall_millis();
        let mut status = self
            .store
            .load_status(entity)
            .await?
            .unwrap_or_else(|| SyncStatus::new(entity));
        mutate(&mut status, now)?;
        status.last_sync_timestamp = now;
        self.store.save_status(&status).await?;
        Ok(status)
    }

    /// Mark an entity running.
    ///
    /// Refuses while another run holds it with a fresh heartbeat. A run whose
    /// heartbeat is older than `max_run_duration` is presumed dead and taken over.
    pub async fn begin(&self, entity: &str) -> Result<SyncStatus, StateError> {
        let max_age = self.max_run_duration.as_millis() as i64;
        let status = self
            .update_status(entity, |s, now| {
                if s.status == SyncState::Running {
                    let age = now - s.last_sync_timestamp;
                    if age < max_age {
                        return Err(StateError::AlreadyRunning {
                            entity: s.entity_name.clone(),
                            age_secs: age / 1000,
                        });
                    }
                    warn!(entity = %s.entity_name, age_secs = age / 1000, "Taking over stale sync run");
                }
                s.status = SyncState::Running;
                s.error_message = None;
                Ok(())
            })
            .await?;
        info!(entity, "Sync started");
        Ok(status)
    }

    /// Add to the record counter and refresh the heartbeat. Never changes state.
    pub async fn add_progress(&self, entity: &str, records: u64) -> Result<(), StateError> {
        self.update_status(entity, |s, _| {
            s.records_synced += records;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Record a contained error without changing state.
    pub async fn note_error(&self, entity: &str, message: &str) -> Result<(), StateError> {
        self.update_status(entity, |s, _| {
            s.error_message = Some(message.to_string());
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn commit(&self, entity: &str, records: u64) -> Result<SyncStatus, StateError> {
        let status = self
            .update_status(entity, |s, _| {
                s.records_synced += records;
                s.status = SyncState::Succeeded;
                Ok(())
            })
            .await?;
        info!(entity, records_synced = status.records_synced, "Sync succeeded");
        Ok(status)
    }

    pub async fn fail(&self, entity: &str, error: &str) -> Result<SyncStatus, StateError> {
        let status = self
            .update_status(entity, |s, _| {
                s.status = SyncState::Failed;
                s.error_message = Some(error.to_string());
                Ok(())
            })
            .await?;
        warn!(entity, error, "Sync failed");
        Ok(status)
    }

    /// Hand an interrupted run back to `pending` so the next run can resume it.
    pub async fn release(&self, entity: &str, reason: &str) -> Result<SyncStatus, StateError> {
        let status = self
            .update_status(entity, |s, _| {
                s.status = SyncState::Pending;
                s.error_message = Some(reason.to_string());
                Ok(())
            })
            .await?;
        info!(entity, reason, "Sync released");
        Ok(status)
    }

    pub async fn status(&self, entity: &str) -> Result<Option<SyncStatus>, StateError> {
        Ok(self.store.load_status(entity).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Coverage
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn coverage(&self, channel_id: ChannelId) -> Result<ChannelCoverage, StateError> {
        Ok(self
            .store
            .load_coverage(channel_id)
            .await?
            .unwrap_or_else(|| ChannelCoverage::new(channel_id)))
    }

    async fn update_coverage<F>(&self, channel_id: ChannelId, mutate: F) -> Result<ChannelCoverage, StateError>
    where
        F: FnOnce(&mut ChannelCoverage) -> bool + Send,
    {
        let lock = self.locks.get(&format!("coverage:{channel_id}"));
        let _guard = lock.lock().await;

        let mut coverage = self.coverage(channel_id).await?;
        if mutate(&mut coverage) {
            self.store.save_coverage(&coverage).await?;
        }
        Ok(coverage)
    }

    /// Record `range` as fully archived. Only call after every record in
    /// the range has been durably written.
    pub async fn mark_complete(&self, channel_id: ChannelId, range: TimeRange) -> Result<bool, StateError> {
        let mut grew = false;
        self.update_coverage(channel_id, |c| {
            grew = c.complete.insert(range);
            grew
        })
        .await?;
        debug!(channel_id, %range, grew, "Coverage updated");
        Ok(grew)
    }

    pub async fn mark_verified(&self, channel_id: ChannelId) -> Result<(), StateError> {
        let now = self.clock.wall_millis();
        self.update_coverage(channel_id, |c| {
            c.last_verified_at = Some(now);
            true
        })
        .await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoints
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn save_checkpoint(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        direction: Direction,
        cursor: EventId,
        records_written: u64,
    ) -> Result<(), StateError> {
        let checkpoint = Checkpoint {
            key: checkpoint_key(channel_id, &range),
            channel_id,
            range,
            direction,
            cursor,
            records_written,
            updated_at: self.clock.wall_millis(),
        };
        self.store.save_checkpoint(&checkpoint).await?;
        Ok(())
    }

    pub async fn load_checkpoint(
        &self,
        channel_id: ChannelId,
        range: &TimeRange,
    ) -> Result<Option<Checkpoint>, StateError> {
        Ok(self.store.load_checkpoint(&checkpoint_key(channel_id, range)).await?)
    }

    pub async fn clear_checkpoint(&self, channel_id: ChannelId, range: &TimeRange) -> Result<(), StateError> {
        self.store.clear_checkpoint(&checkpoint_key(channel_id, range)).await?;
        Ok(())
    }
}
