//! Turning gap reports into ordered work units.

use std::cmp::Reverse;

use super::types::{ScheduleOrder, UnitKind, WorkUnit};
use crate::gap_detector::{GapReport, SyncMode};
use crate::interval::TimeRange;

fn priority(range: &TimeRange, order: ScheduleOrder) -> i64 {
    match order {
        ScheduleOrder::NewestFirst => range.end,
        ScheduleOrder::OldestFirst => range.start.saturating_neg(),
    }
}

/// Units for one channel's planned ranges, each no longer than `max_span`.
///
/// Splits are epoch-aligned, so the same gap yields the same units (and
/// checkpoint keys) on every run.
#[must_use]
pub fn plan_units(report: &GapReport, mode: SyncMode, order: ScheduleOrder, max_span: i64) -> Vec<WorkUnit> {
    report
        .planned
        .iter()
        .flat_map(|r| r.split_aligned(max_span))
        .map(|range| {
            let kind = if report.gaps.iter().any(|g| g.overlaps(&range)) {
                UnitKind::Gap
            } else {
                UnitKind::Verify
            };
            WorkUnit {
                channel_id: report.channel_id,
                range,
                priority: priority(&range, order),
                mode,
                kind,
            }
        })
        .collect()
}

/// Highest priority first; ties broken by channel then start.
pub fn sort_units(units: &mut [WorkUnit]) {
    units.sort_by_key(|u| (Reverse(u.priority), u.channel_id, u.range.start));
}
