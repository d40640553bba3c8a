// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paged, rate-limited, retrying walk over a channel's history.
//!
//! [`Crawler::crawl`] returns a [`PageStream`]: nothing is fetched until
//! [`PageStream::next_page`] is called, and every page carries the cursor
//! needed to resume right after it. Each fetch:
//!
//! 1. takes a token from the rate limiter,
//! 2. calls the source,
//! 3. on a transient error, backs off (honouring retry-after) and retries,
//! 4. on a terminal error, stops the stream.
//!
//! Raw events are normalized on the way out. Events that fail to
//! normalize are handed back separately as rejects instead of failing the
//! page.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::event_record::{normalize, ChannelId, EventId, EventRecord, RecordError};
use crate::interval::TimeRange;
use crate::rate_limiter::RateLimiter;
use crate::resilience::retry::{Backoff, RetryConfig};
use crate::source::{ChannelInfo, Direction, EventSource, Page, PageRequest, SourceError, SOURCE_RESOURCE};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("channel {channel_id} unavailable: {reason}")]
    ChannelUnavailable { channel_id: ChannelId, reason: String },
    #[error("source call failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: SourceError },
    #[error("source call failed: {0}")]
    Source(SourceError),
}

impl CrawlError {
    fn from_terminal(err: SourceError) -> Self {
        match err {
            SourceError::ChannelUnavailable { channel_id, reason } => {
                Self::ChannelUnavailable { channel_id, reason }
            }
            other => Self::Source(other),
        }
    }
}

/// One page, normalized.
#[derive(Debug, Clone)]
pub struct CrawledPage {
    pub records: Vec<EventRecord>,
    /// Raw event ID (as delivered) and why it was rejected.
    pub rejected: Vec<(String, RecordError)>,
    /// Resume point after this page; `None` if this was the last page.
    pub cursor: Option<EventId>,
    /// 1-based page number within this stream.
    pub index: u64,
}

#[derive(Clone)]
pub struct Crawler {
    source: Arc<dyn EventSource>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    page_size: usize,
}

impl Crawler {
    pub fn new(
        source: Arc<dyn EventSource>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
        page_size: usize,
    ) -> Self {
        Self {
            source,
            limiter,
            clock,
            retry,
            page_size: page_size.max(1),
        }
    }

    /// Lazy stream over `range`, from the edge `direction` starts at.
    pub fn crawl(&self, channel_id: ChannelId, range: TimeRange, direction: Direction) -> PageStream {
        self.stream(channel_id, range, direction, None)
    }

    /// Lazy stream over `range`, continuing strictly past `cursor`.
    pub fn resume(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        direction: Direction,
        cursor: EventId,
    ) -> PageStream {
        self.stream(channel_id, range, direction, Some(cursor))
    }

    fn stream(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        direction: Direction,
        cursor: Option<EventId>,
    ) -> PageStream {
        PageStream {
            crawler: self.clone(),
            request: PageRequest {
                channel_id,
                range,
                direction,
                cursor,
                limit: self.page_size,
            },
            exhausted: range.is_empty(),
            pages: 0,
        }
    }

    pub async fn channel_info(&self, channel_id: ChannelId) -> Result<ChannelInfo, CrawlError> {
        self.call("channel_info", || self.source.channel_info(channel_id)).await
    }

    /// A single page with retries, outside any stream. Used for sampling.
    pub async fn fetch_page(&self, request: &PageRequest) -> Result<Page, CrawlError> {
        self.call("fetch_page", || self.source.fetch_page(request)).await
    }

    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, CrawlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut backoff = Backoff::new(self.retry.clone());
        loop {
            self.limiter.acquire(SOURCE_RESOURCE).await;
            let err = match f().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.is_transient() {
                return Err(CrawlError::from_terminal(err));
            }
            if let SourceError::RateLimited { retry_after } = &err {
                self.limiter.backoff(SOURCE_RESOURCE, *retry_after);
            }

            let delay = backoff.next_delay(&mut rand::thread_rng(), err.retry_after());
            let Some(delay) = delay else {
                warn!(operation, attempts = backoff.attempts(), error = %err, "Source call giving up");
                return Err(CrawlError::RetriesExhausted {
                    attempts: backoff.attempts(),
                    last_error: err,
                });
            };
            warn!(
                operation,
                attempt = backoff.attempts(),
                error = %err,
                ?delay,
                "Transient source error, retrying"
            );
            crate::metrics::record_fetch_retry(retry_reason(&err));
            self.clock.sleep(delay).await;
        }
    }
}

fn retry_reason(err: &SourceError) -> &'static str {
    match err {
        SourceError::RateLimited { .. } => "rate_limited",
        SourceError::Timeout => "timeout",
        SourceError::Server { .. } => "server",
        _ => "other",
    }
}

/// Lazy page sequence over one channel and time range.
pub struct PageStream {
    crawler: Crawler,
    request: PageRequest,
    exhausted: bool,
    pages: u64,
}

impl PageStream {
    /// Fetch the next page, or `None` once the range is exhausted.
    ///
    /// After an error the stream stays where it was; calling again retries
    /// the same page.
    pub async fn next_page(&mut self) -> Result<Option<CrawledPage>, CrawlError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self.crawler.fetch_page(&self.request).await?;
        self.pages += 1;
        crate::metrics::record_page_fetched(self.request.direction.as_str(), page.events.len());

        let channel_id = self.request.channel_id;
        let range = self.request.range;
        let mut records = Vec::with_capacity(page.events.len());
        let mut rejected = Vec::new();
        for raw in &page.events {
            match normalize(raw, channel_id) {
                Ok(r) if range.contains(r.created_at) => records.push(r),
                Ok(r) => debug!(event_id = r.event_id, "Dropping event outside requested range"),
                Err(e) => rejected.push((raw.id.clone(), e)),
            }
        }

        // An empty page ends the stream even if the source offers a cursor.
        let next = if page.events.is_empty() { None } else { page.next_cursor };
        match next {
            Some(c) => self.request.cursor = Some(c),
            None => self.exhausted = true,
        }

        debug!(
            channel_id,
            page = self.pages,
            records = records.len(),
            rejected = rejected.len(),
            "Fetched page"
        );
        Ok(Some(CrawledPage {
            records,
            rejected,
            cursor: next,
            index: self.pages,
        }))
    }

    /// Cursor the next fetch would use.
    #[must_use]
    pub fn cursor(&self) -> Option<EventId> {
        self.request.cursor
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
