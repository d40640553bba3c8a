// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap detection: what still needs crawling for a channel.
//!
//! The core answer is pure interval arithmetic: the requested window
//! (clamped to the channel's lifetime) minus the channel's complete
//! coverage. What gets *planned* on top of that depends on [`SyncMode`]:
//!
//! ```text
//! requested  |=======================================|
//! coverage       [#####)       [##########)
//! gaps       [===)     [=======)          [==========)
//!
//! fast_fill  gaps closer than min_granularity merged (re-crawls the
//!            covered stretch between them; upserts make that harmless)
//! thorough   gaps as-is, plus suspect stretches inside coverage:
//!            - edge windows whose sampled source IDs are missing locally
//!            - optional hourly low-count runs (see [`hourly`])
//! ```
//!
//! Suspects are re-crawled but never unmark coverage.

pub mod hourly;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::crawler::{CrawlError, Crawler};
use crate::event_record::{normalize, ChannelId};
use crate::interval::{coalesce, IntervalSet, TimeRange};
use crate::snowflake;
use crate::source::{Direction, PageRequest};
use crate::storage::traits::{EventStore, StorageError};
use crate::sync_state::{StateError, SyncStateTracker};

pub use hourly::HourlyScanConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Coarse units, no re-verification.
    #[default]
    FastFill,
    /// Exact gaps plus re-verification of complete ranges.
    #[serde(alias = "paranoid")]
    Thorough,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastFill => "fast_fill",
            Self::Thorough => "thorough",
        }
    }
}

#[derive(Debug, Error)]
pub enum GapError {
    #[error(transparent)]
    Crawl(#[from] CrawlError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("store read failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct GapConfig {
    /// fast_fill merges gaps separated by less than this.
    pub min_granularity: Duration,
    /// Width of the window sampled at each edge of a complete range.
    pub edge_window: Duration,
    /// Source events sampled per edge window.
    pub sample_size: usize,
    /// Hourly low-count scan in thorough mode; `None` disables it.
    pub hourly: Option<HourlyScanConfig>,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            min_granularity: Duration::from_secs(3 * 3600),
            edge_window: Duration::from_secs(3600),
            sample_size: 50,
            hourly: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapReport {
    pub channel_id: ChannelId,
    /// Requested range clamped to the channel's lifetime; `None` if nothing
    /// of it is valid.
    pub window: Option<TimeRange>,
    /// Exactly `window` minus coverage: sorted, disjoint.
    pub gaps: Vec<TimeRange>,
    /// Stretches inside coverage that failed verification (thorough only).
    pub suspects: Vec<TimeRange>,
    /// What the scheduler should crawl: sorted, disjoint.
    pub planned: Vec<TimeRange>,
}

impl GapReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.planned.is_empty()
    }

    #[must_use]
    pub fn planned_millis(&self) -> i64 {
        self.planned.iter().map(TimeRange::len_millis).sum()
    }
}

pub struct GapDetector {
    tracker: Arc<SyncStateTracker>,
    primary: Arc<dyn EventStore>,
    crawler: Crawler,
    clock: Arc<dyn Clock>,
    config: GapConfig,
}

impl GapDetector {
    pub fn new(
        tracker: Arc<SyncStateTracker>,
        primary: Arc<dyn EventStore>,
        crawler: Crawler,
        clock: Arc<dyn Clock>,
        config: GapConfig,
    ) -> Self {
        Self {
            tracker,
            primary,
            crawler,
            clock,
            config,
        }
    }

    /// Clamp `requested` to `[channel creation, now)`.
    pub async fn valid_window(
        &self,
        channel_id: ChannelId,
        requested: TimeRange,
    ) -> Result<Option<TimeRange>, GapError> {
        let info = self.crawler.channel_info(channel_id).await?;
        let created = if info.created_at > 0 {
            info.created_at
        } else {
            snowflake::timestamp_millis(channel_id)
        };
        let lifetime = TimeRange::new(created, self.clock.wall_millis());
        Ok(requested.intersect(&lifetime))
    }

    #[instrument(skip(self), fields(mode = mode.as_str()))]
    pub async fn find_gaps(
        &self,
        channel_id: ChannelId,
        requested: TimeRange,
        mode: SyncMode,
    ) -> Result<GapReport, GapError> {
        let Some(window) = self.valid_window(channel_id, requested).await? else {
            debug!(channel_id, %requested, "Requested range outside channel lifetime");
            return Ok(GapReport {
                channel_id,
                ..Default::default()
            });
        };

        let coverage = self.tracker.coverage(channel_id).await?;
        let gaps = coverage.complete.difference(&window);

        let (suspects, planned) = match mode {
            SyncMode::FastFill => {
                let min_gap = self.config.min_granularity.as_millis() as i64;
                (Vec::new(), coalesce(&gaps, min_gap))
            }
            SyncMode::Thorough => {
                let covered = coverage.complete.intersection(&window);
                let suspects = self.verify(channel_id, &covered).await?;
                self.tracker.mark_verified(channel_id).await?;
                let planned = IntervalSet::from_ranges(gaps.iter().chain(&suspects).copied());
                (suspects, planned.ranges().to_vec())
            }
        };

        crate::metrics::record_gaps_found(mode.as_str(), gaps.len(), suspects.len());
        info!(
            channel_id,
            %window,
            gaps = gaps.len(),
            suspects = suspects.len(),
            planned = planned.len(),
            "Gap detection complete"
        );
        Ok(GapReport {
            channel_id,
            window: Some(window),
            gaps,
            suspects,
            planned,
        })
    }

    /// Re-check complete ranges. Returns suspect stretches, sorted and disjoint.
    async fn verify(&self, channel_id: ChannelId, covered: &[TimeRange]) -> Result<Vec<TimeRange>, GapError> {
        let mut suspects = IntervalSet::new();
        let w = self.config.edge_window.as_millis() as i64;

        for piece in covered {
            let edges = if piece.len_millis() <= 2 * w {
                vec![(*piece, Direction::Ascending)]
            } else {
                vec![
                    (TimeRange::new(piece.start, piece.start + w), Direction::Ascending),
                    (TimeRange::new(piece.end - w, piece.end), Direction::Descending),
                ]
            };
            for (edge, direction) in edges {
                if self.edge_is_suspect(channel_id, edge, direction).await? {
                    debug!(channel_id, %edge, "Edge window failed verification");
                    suspects.insert(edge);
                }
            }

            if let Some(cfg) = &self.config.hourly {
                let counts = self.primary.hourly_counts(channel_id, *piece).await?;
                for run in hourly::find_low_count_runs(&counts, *piece, cfg) {
                    debug!(channel_id, %run, "Low hourly counts");
                    suspects.insert(run);
                }
            }
        }
        Ok(suspects.ranges().to_vec())
    }

    /// Sample the source at one edge and confirm every sampled event is
    /// already archived.
    async fn edge_is_suspect(
        &self,
        channel_id: ChannelId,
        edge: TimeRange,
        direction: Direction,
    ) -> Result<bool, GapError> {
        let request = PageRequest {
            channel_id,
            range: edge,
            direction,
            cursor: None,
            limit: self.config.sample_size.max(1),
        };
        let page = self.crawler.fetch_page(&request).await?;
        let sampled: Vec<_> = page
            .events
            .iter()
            .filter_map(|raw| normalize(raw, channel_id).ok())
            .filter(|r| edge.contains(r.created_at))
            .map(|r| r.event_id)
            .collect();
        if sampled.is_empty() {
            return Ok(false);
        }

        let archived: HashSet<_> = self
            .primary
            .range(channel_id, edge, usize::MAX)
            .await?
            .into_iter()
            .map(|r| r.event_id)
            .collect();
        Ok(sampled.iter().any(|id| !archived.contains(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event_record::{EventRecord, RawEvent};
    use crate::interval::{DAY_MILLIS, HOUR_MILLIS};
    use crate::rate_limiter::RateLimiter;
    use crate::resilience::retry::RetryConfig;
    use crate::source::{ChannelInfo, EventSource, Page, SourceError};
    use crate::storage::memory::InMemoryStore;
    use async_trait::async_trait;

    const NOW: i64 = 100 * DAY_MILLIS;

    /// One event at the top of every hour, from `created_at` on.
    struct Hourly {
        created_at: i64,
    }

    fn raw_at(ts: i64) -> RawEvent {
        RawEvent {
            id: (ts / 1000).to_string(),
            author_id: "1".into(),
            created_at: chrono::DateTime::from_timestamp_millis(ts).unwrap().to_rfc3339(),
            ..Default::default()
        }
    }

    #[async_trait]
    impl EventSource for Hourly {
        async fn channel_info(&self, channel_id: ChannelId) -> Result<ChannelInfo, SourceError> {
            Ok(ChannelInfo { channel_id, created_at: self.created_at, name: None })
        }

        async fn fetch_page(&self, req: &PageRequest) -> Result<Page, SourceError> {
            let first = (req.range.start + HOUR_MILLIS - 1).div_euclid(HOUR_MILLIS) * HOUR_MILLIS;
            let mut ts: Vec<i64> = (first..req.range.end).step_by(HOUR_MILLIS as usize).collect();
            if req.direction == Direction::Descending {
                ts.reverse();
            }
            ts.truncate(req.limit);
            Ok(Page { events: ts.into_iter().map(raw_at).collect(), next_cursor: None })
        }
    }

    struct Fixture {
        detector: GapDetector,
        tracker: Arc<SyncStateTracker>,
        primary: Arc<InMemoryStore>,
    }

    fn fixture(created_at: i64, config: GapConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW));
        let tracker = Arc::new(SyncStateTracker::new(
            Arc::new(InMemoryStore::new()),
            clock.clone(),
            Duration::from_secs(3600),
        ));
        let primary = Arc::new(InMemoryStore::named("primary"));
        let limiter = Arc::new(RateLimiter::new(clock.clone(), Duration::from_secs(30)));
        let crawler = Crawler::new(Arc::new(Hourly { created_at }), limiter, clock.clone(), RetryConfig::query(), 100);
        let detector = GapDetector::new(tracker.clone(), primary.clone(), crawler, clock, config);
        Fixture { detector, tracker, primary }
    }

    #[tokio::test]
    async fn test_gaps_are_window_minus_coverage() {
        let f = fixture(0, GapConfig::default());
        f.tracker.mark_complete(1, TimeRange::new(2 * DAY_MILLIS, 3 * DAY_MILLIS)).await.unwrap();

        let report = f
            .detector
            .find_gaps(1, TimeRange::new(0, 5 * DAY_MILLIS), SyncMode::Thorough)
            .await
            .unwrap();
        assert_eq!(
            report.gaps,
            vec![
                TimeRange::new(0, 2 * DAY_MILLIS),
                TimeRange::new(3 * DAY_MILLIS, 5 * DAY_MILLIS),
            ]
        );
    }

    #[tokio::test]
    async fn test_window_is_clamped_to_channel_lifetime() {
        let f = fixture(10 * DAY_MILLIS, GapConfig::default());

        let report = f
            .detector
            .find_gaps(1, TimeRange::new(0, NOW + DAY_MILLIS), SyncMode::FastFill)
            .await
            .unwrap();
        assert_eq!(report.window, Some(TimeRange::new(10 * DAY_MILLIS, NOW)));
        assert_eq!(report.planned, vec![TimeRange::new(10 * DAY_MILLIS, NOW)]);
    }

    #[tokio::test]
    async fn test_range_before_creation_is_empty() {
        let f = fixture(10 * DAY_MILLIS, GapConfig::default());
        let report = f
            .detector
            .find_gaps(1, TimeRange::new(0, DAY_MILLIS), SyncMode::FastFill)
            .await
            .unwrap();
        assert!(report.window.is_none());
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_fast_fill_merges_close_gaps() {
        let f = fixture(0, GapConfig::default());
        // One hour covered between two gaps; below the 3h granularity.
        f.tracker
            .mark_complete(1, TimeRange::new(DAY_MILLIS, DAY_MILLIS + HOUR_MILLIS))
            .await
            .unwrap();

        let requested = TimeRange::new(0, 2 * DAY_MILLIS);
        let fast = f.detector.find_gaps(1, requested, SyncMode::FastFill).await.unwrap();
        assert_eq!(fast.gaps.len(), 2);
        assert_eq!(fast.planned, vec![requested]);
    }

    #[tokio::test]
    async fn test_thorough_keeps_gaps_exact_when_edges_verify() {
        let f = fixture(0, GapConfig::default());
        let covered = TimeRange::new(DAY_MILLIS, DAY_MILLIS + 6 * HOUR_MILLIS);
        // Archive everything the source has in the covered stretch.
        for h in 0..6 {
            let ts = DAY_MILLIS + h * HOUR_MILLIS;
            f.primary.upsert(&EventRecord::new((ts / 1000) as u64, 1, 1, ts)).await.unwrap();
        }
        f.tracker.mark_complete(1, covered).await.unwrap();

        let report = f
            .detector
            .find_gaps(1, TimeRange::new(0, 2 * DAY_MILLIS), SyncMode::Thorough)
            .await
            .unwrap();
        assert!(report.suspects.is_empty());
        assert_eq!(report.planned, report.gaps);
        assert!(f.tracker.coverage(1).await.unwrap().last_verified_at.is_some());
    }

    #[tokio::test]
    async fn test_thorough_flags_undercounted_edge() {
        let f = fixture(0, GapConfig::default());
        let covered = TimeRange::new(DAY_MILLIS, DAY_MILLIS + 6 * HOUR_MILLIS);
        // Marked complete, but the first hours were never archived.
        for h in 3..6 {
            let ts = DAY_MILLIS + h * HOUR_MILLIS;
            f.primary.upsert(&EventRecord::new((ts / 1000) as u64, 1, 1, ts)).await.unwrap();
        }
        f.tracker.mark_complete(1, covered).await.unwrap();

        let report = f
            .detector
            .find_gaps(1, TimeRange::new(0, 2 * DAY_MILLIS), SyncMode::Thorough)
            .await
            .unwrap();
        assert_eq!(report.suspects, vec![TimeRange::new(DAY_MILLIS, DAY_MILLIS + HOUR_MILLIS)]);
        // Suspect is adjacent to the leading gap, so they plan as one.
        assert_eq!(report.planned[0], TimeRange::new(0, DAY_MILLIS + HOUR_MILLIS));
        // Coverage untouched.
        assert!(f.tracker.coverage(1).await.unwrap().complete.covers(&covered));
    }

    #[tokio::test]
    async fn test_thorough_hourly_scan_plans_quiet_hours_for_verification() {
        let config = GapConfig {
            hourly: Some(HourlyScanConfig { min_samples: 3, ..Default::default() }),
            ..Default::default()
        };
        let f = fixture(0, config);
        let covered = TimeRange::new(DAY_MILLIS, 4 * DAY_MILLIS);
        let quiet = TimeRange::new(2 * DAY_MILLIS + 10 * HOUR_MILLIS, 2 * DAY_MILLIS + 13 * HOUR_MILLIS);
        // Every hour archived except three mid-morning hours of day two.
        for ts in (covered.start..covered.end).step_by(HOUR_MILLIS as usize) {
            if !quiet.contains(ts) {
                f.primary.upsert(&EventRecord::new((ts / 1000) as u64, 1, 1, ts)).await.unwrap();
            }
        }
        f.tracker.mark_complete(1, covered).await.unwrap();

        let report = f.detector.find_gaps(1, covered, SyncMode::Thorough).await.unwrap();
        assert!(report.gaps.is_empty());
        assert_eq!(report.suspects, vec![quiet]);
        assert_eq!(report.planned, vec![quiet]);

        let units = crate::scheduler::plan_units(
            &report,
            SyncMode::Thorough,
            crate::scheduler::ScheduleOrder::NewestFirst,
            7 * DAY_MILLIS,
        );
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].range, quiet);
        assert_eq!(units[0].kind, crate::scheduler::UnitKind::Verify);

        // Without the scan the same archive looks clean.
        let plain = fixture(0, GapConfig::default());
        for ts in (covered.start..covered.end).step_by(HOUR_MILLIS as usize) {
            if !quiet.contains(ts) {
                plain.primary.upsert(&EventRecord::new((ts / 1000) as u64, 1, 1, ts)).await.unwrap();
            }
        }
        plain.tracker.mark_complete(1, covered).await.unwrap();
        let report = plain.detector.find_gaps(1, covered, SyncMode::Thorough).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_fast_fill_skips_verification() {
        let f = fixture(0, GapConfig::default());
        f.tracker
            .mark_complete(1, TimeRange::new(DAY_MILLIS, 2 * DAY_MILLIS))
            .await
            .unwrap();

        let report = f
            .detector
            .find_gaps(1, TimeRange::new(0, 3 * DAY_MILLIS), SyncMode::FastFill)
            .await
            .unwrap();
        assert!(report.suspects.is_empty());
        assert!(f.tracker.coverage(1).await.unwrap().last_verified_at.is_none());
    }

    #[test]
    fn test_mode_parses_paranoid_alias() {
        #[derive(Deserialize)]
        struct W {
            mode: SyncMode,
        }
        let w: W = toml::from_str("mode = \"paranoid\"").unwrap();
        assert_eq!(w.mode, SyncMode::Thorough);
        let w: W = toml::from_str("mode = \"fast_fill\"").unwrap();
        assert_eq!(w.mode, SyncMode::FastFill);
    }
}
