//! Public types for the backfill scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::event_record::ChannelId;
use crate::gap_detector::SyncMode;
use crate::interval::TimeRange;
use crate::source::Direction;
use crate::storage::traits::StorageError;

/// Which end of history is backfilled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOrder {
    /// Recent data first; units crawl newest to oldest.
    #[default]
    NewestFirst,
    OldestFirst,
}

impl ScheduleOrder {
    /// Crawl direction used inside each unit.
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::NewestFirst => Direction::Descending,
            Self::OldestFirst => Direction::Ascending,
        }
    }
}

/// Scheduler phase during a run.
///
/// Use [`super::BackfillScheduler::phase_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// No run in progress
    Idle,
    /// Validating config and probing stores
    Preflight,
    /// Repairing secondary copies queued by earlier runs
    Reconciling,
    /// Detecting gaps and building work units
    Planning,
    /// Dispatching work units
    Backfilling,
    /// Run finished (summary available)
    Finished,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Preflight => write!(f, "Preflight"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Planning => write!(f, "Planning"),
            Self::Backfilling => write!(f, "Backfilling"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Range not yet covered.
    Gap,
    /// Range already covered but flagged by verification.
    Verify,
}

/// One (channel, time range) task. Lives only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub channel_id: ChannelId,
    pub range: TimeRange,
    /// Higher runs sooner.
    pub priority: i64,
    pub mode: SyncMode,
    pub kind: UnitKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Succeeded,
    Failed,
    /// The channel is gone; the rest of its units are skipped.
    ChannelUnavailable,
    /// Stopped at a page boundary; its checkpoint remains.
    Cancelled,
    /// Never started (cancelled run, or its channel became unavailable).
    Skipped,
}

impl UnitStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "success",
            Self::Failed => "failure",
            Self::ChannelUnavailable => "channel_unavailable",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

/// Completion event for one work unit, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitEvent {
    pub channel_id: ChannelId,
    pub range: TimeRange,
    pub kind: UnitKind,
    pub status: UnitStatus,
    /// Records landed in the lead store by this unit during this run.
    pub records: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every unit succeeded.
    Success,
    /// Progress made, but some units or channels failed.
    PartialSuccess,
    /// Stopped early on request. Coverage reflects what finished.
    Cancelled,
}

impl RunOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Cancelled => "cancelled",
        }
    }

    /// Process exit status for a CLI wrapper. A run aborted with
    /// [`RunError`] should exit with 1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::PartialSuccess => 2,
            Self::Cancelled => 130,
        }
    }
}

/// End-of-run report: what completed, failed and was skipped.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub channels: usize,
    pub completed: Vec<UnitEvent>,
    pub failed: Vec<UnitEvent>,
    pub skipped: Vec<UnitEvent>,
    /// Channels that never got as far as planning, with the reason.
    pub skipped_channels: Vec<(ChannelId, String)>,
    /// Channels that failed before any unit ran (gap detection errors).
    pub failed_channels: Vec<(ChannelId, String)>,
    pub records_synced: u64,
    pub records_rejected: u64,
    /// Records that missed the secondary and were queued for repair.
    pub records_partial: u64,
    pub reconciled: usize,
    /// Unit tasks that panicked. Their ranges stay uncovered.
    pub panicked: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            RunOutcome::Cancelled
        } else if self.failed.is_empty()
            && self.failed_channels.is_empty()
            && self.skipped.is_empty()
            && self.panicked == 0
        {
            RunOutcome::Success
        } else {
            RunOutcome::PartialSuccess
        }
    }

    #[must_use]
    pub fn completed_millis(&self) -> i64 {
        self.completed.iter().map(|u| u.range.len_millis()).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} channels, {} units completed, {} failed, {} skipped, {} records synced ({} rejected, {} queued for repair) in {:.1}s",
            self.outcome().as_str(),
            self.channels,
            self.completed.len(),
            self.failed.len() + self.failed_channels.len() + self.panicked,
            self.skipped.len() + self.skipped_channels.len(),
            self.records_synced,
            self.records_rejected,
            self.records_partial,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no store targeted by the write policy is reachable: {0}")]
    StoresUnreachable(String),
    #[error("failed to connect store: {0}")]
    Connect(#[source] StorageError),
    #[error("a run is already in progress")]
    AlreadyRunning,
}
