// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Time-ordered event identifiers.
//!
//! Source event IDs embed their creation time in the upper 42 bits as
//! milliseconds since [`SOURCE_EPOCH_MILLIS`]. Ordering by ID is therefore
//! ordering by creation time, which is what lets the crawler use an ID as a
//! pagination cursor and date a channel by its own ID.

use crate::event_record::EventId;

/// 2015-01-01T00:00:00Z in epoch milliseconds.
pub const SOURCE_EPOCH_MILLIS: i64 = 1_420_070_400_000;

const TIMESTAMP_SHIFT: u32 = 22;

/// Creation time (epoch ms) encoded in an event ID.
#[must_use]
pub fn timestamp_millis(id: EventId) -> i64 {
    (id >> TIMESTAMP_SHIFT) as i64 + SOURCE_EPOCH_MILLIS
}
