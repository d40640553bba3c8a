// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Low-count run detection over hourly record counts.
//!
//! A range can be marked complete and still be missing records if an
//! earlier run undercounted. Archived traffic has a strong daily rhythm, so
//! each hour is compared against the median for its hour of day: a run of
//! consecutive hours far below their medians is suspect.

use chrono::{DateTime, Timelike};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::interval::{TimeRange, HOUR_MILLIS};
use crate::storage::traits::hour_bucket;

/// Longest run examined from any starting hour.
const MAX_RUN_HOURS: usize = 24;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HourlyScanConfig {
    /// An hour is low when its count is below `median * threshold_ratio`.
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,
    /// Shortest run of low hours worth reporting.
    #[serde(default = "default_min_consecutive_hours")]
    pub min_consecutive_hours: usize,
    /// Hours of day (UTC) before this are never flagged.
    #[serde(default = "default_min_hour_of_day")]
    pub min_hour_of_day: u32,
    /// Hours of day with fewer samples use `default_median`.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_median")]
    pub default_median: f64,
}

fn default_threshold_ratio() -> f64 { 0.30 }
fn default_min_consecutive_hours() -> usize { 2 }
fn default_min_hour_of_day() -> u32 { 5 }
fn default_min_samples() -> usize { 10 }
fn default_median() -> f64 { 10.0 }

impl Default for HourlyScanConfig {
    fn default() -> Self {
        Self {
            threshold_ratio: default_threshold_ratio(),
            min_consecutive_hours: default_min_consecutive_hours(),
            min_hour_of_day: default_min_hour_of_day(),
            min_samples: default_min_samples(),
            default_median: default_median(),
        }
    }
}

fn hour_of_day(bucket: i64) -> u32 {
    DateTime::from_timestamp_millis(bucket).map_or(0, |dt| dt.hour())
}

fn median(values: &mut [u64]) -> f64 {
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) as f64 / 2.0
    } else {
        values[mid] as f64
    }
}

/// Median count per hour of day over every hour bucket in `hours`.
fn hour_of_day_medians(hours: &[(i64, u64)], config: &HourlyScanConfig) -> [f64; 24] {
    let mut samples: [Vec<u64>; 24] = Default::default();
    for &(bucket, count) in hours {
        samples[hour_of_day(bucket) as usize].push(count);
    }
    let mut medians = [config.default_median; 24];
    for (hour, values) in samples.iter_mut().enumerate() {
        if values.len() >= config.min_samples {
            medians[hour] = median(values);
        }
    }
    medians
}

/// Find runs of suspiciously quiet hours inside `range`.
///
/// `counts` maps hour bucket starts to record counts; absent hours count as
/// zero. Only hours lying wholly inside `range` are examined. Returned
/// ranges are sorted, disjoint, and hour-aligned.
#[must_use]
pub fn find_low_count_runs(
    counts: &BTreeMap<i64, u64>,
    range: TimeRange,
    config: &HourlyScanConfig,
) -> Vec<TimeRange> {
    let first = {
        let b = hour_bucket(range.start);
        if b < range.start { b + HOUR_MILLIS } else { b }
    };
    let hours: Vec<(i64, u64)> = (0..)
        .map(|i| first + i * HOUR_MILLIS)
        .take_while(|b| b + HOUR_MILLIS <= range.end)
        .map(|b| (b, counts.get(&b).copied().unwrap_or(0)))
        .collect();
    if hours.is_empty() {
        return Vec::new();
    }

    let medians = hour_of_day_medians(&hours, config);
    let is_low = |(bucket, count): (i64, u64)| {
        let hod = hour_of_day(bucket);
        hod >= config.min_hour_of_day && (count as f64) < medians[hod as usize] * config.threshold_ratio
    };

    let mut runs = Vec::new();
    let mut i = 0;
    while i < hours.len() {
        if !is_low(hours[i]) {
            i += 1;
            continue;
        }
        let mut end = i;
        while end + 1 < hours.len() && end + 1 - i < MAX_RUN_HOURS && is_low(hours[end + 1]) {
            end += 1;
        }
        if end + 1 - i >= config.min_consecutive_hours {
            runs.push(TimeRange::new(hours[i].0, hours[end].0 + HOUR_MILLIS));
            i = end + 1;
        } else {
            i += 1;
        }
    }
    runs
}
