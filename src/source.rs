// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The upstream event source.
//!
//! The engine only needs two calls from the outside world: fetch one page
//! of a channel's history, and describe a channel. Whatever speaks the
//! actual wire protocol implements [`EventSource`] and maps its failures
//! onto [`SourceError`] (see [`SourceError::from_status`] for HTTP).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::event_record::{ChannelId, EventId, RawEvent};
use crate::interval::TimeRange;

/// Rate limiter key for source calls.
pub const SOURCE_RESOURCE: &str = "source";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Oldest first; the cursor is a lower bound (exclusive).
    Ascending,
    /// Newest first; the cursor is an upper bound (exclusive).
    Descending,
}

impl Direction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ascending => "ascending",
            Self::Descending => "descending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub channel_id: ChannelId,
    pub range: TimeRange,
    pub direction: Direction,
    /// Resume after this event. `None` starts at the range edge.
    pub cursor: Option<EventId>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub events: Vec<RawEvent>,
    /// Cursor for the next page; `None` once the range is exhausted.
    pub next_cursor: Option<EventId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    /// Epoch ms. Nothing can exist before this.
    pub created_at: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("rate limited by source (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("source request timed out")]
    Timeout,
    #[error("source server error: HTTP {status}")]
    Server { status: u16 },
    /// Deleted, or access revoked. Retrying won't help.
    #[error("channel {channel_id} unavailable: {reason}")]
    ChannelUnavailable { channel_id: ChannelId, reason: String },
    #[error("source rejected request: {0}")]
    Rejected(String),
}

impl SourceError {
    /// Whether retrying the same request might succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout | Self::Server { .. })
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify a failed HTTP response.
    #[must_use]
    pub fn from_status(channel_id: ChannelId, status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after },
            403 => Self::ChannelUnavailable {
                channel_id,
                reason: "access denied".into(),
            },
            404 | 410 => Self::ChannelUnavailable {
                channel_id,
                reason: "not found".into(),
            },
            408 => Self::Timeout,
            s if s >= 500 => Self::Server { status: s },
            s => Self::Rejected(format!("HTTP {s}")),
        }
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn channel_info(&self, channel_id: ChannelId) -> Result<ChannelInfo, SourceError>;

    /// One page of events inside `request.range`, in `request.direction`
    /// order, strictly past `request.cursor`.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError>;
}
