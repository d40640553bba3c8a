//! Processing a single work unit.
//!
//! Pages are handled strictly in order: fetch, write, record progress, save
//! the checkpoint, then (and only then) fetch the next. The stop signal is
//! checked before each fetch, so an in-flight page always finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::types::{UnitEvent, UnitStatus, WorkUnit};
use crate::clock::Clock;
use crate::crawler::{CrawlError, Crawler, PageStream};
use crate::interval::TimeRange;
use crate::source::Direction;
use crate::sync_state::{channel_entity, StateError, SyncStateTracker};
use crate::writer::{DualStoreWriter, WriteError, WritePolicy};

/// Everything a unit task needs, shared across tasks.
pub(super) struct UnitContext {
    pub crawler: Crawler,
    pub tracker: Arc<SyncStateTracker>,
    pub writer: Arc<DualStoreWriter>,
    pub clock: Arc<dyn Clock>,
    pub policy: WritePolicy,
    pub direction: Direction,
    pub inter_page_delay: Duration,
}

/// Operator cancellation or an internal abort.
#[derive(Clone)]
pub(super) struct StopSignal {
    external: watch::Receiver<bool>,
    abort: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new(external: watch::Receiver<bool>) -> Self {
        Self {
            external,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_set(&self) -> bool {
        *self.external.borrow() || self.abort.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.external.borrow()
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

#[derive(Debug, Error)]
enum UnitError {
    #[error(transparent)]
    Crawl(#[from] CrawlError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("{count} records failed to reach the {store} store: {reason}")]
    StoreFailures { store: &'static str, count: usize, reason: String },
}

#[derive(Default)]
struct Progress {
    records: u64,
    rejected: u64,
    partial: u64,
}

pub(super) struct UnitResult {
    pub event: UnitEvent,
    pub rejected: u64,
    pub partial: u64,
    /// The lead store was down outright.
    pub store_outage: bool,
}

#[instrument(skip(ctx, stop), fields(channel_id = unit.channel_id, range = %unit.range))]
pub(super) async fn process_unit(ctx: Arc<UnitContext>, unit: WorkUnit, stop: StopSignal) -> UnitResult {
    let started = Instant::now();
    let mut progress = Progress::default();
    let result = run_pages(&ctx, &unit, &stop, &mut progress).await;

    let (status, error, store_outage) = match result {
        Ok(true) => (UnitStatus::Succeeded, None, false),
        Ok(false) => (UnitStatus::Cancelled, None, false),
        Err(UnitError::Crawl(e @ CrawlError::ChannelUnavailable { .. })) => {
            (UnitStatus::ChannelUnavailable, Some(e.to_string()), false)
        }
        Err(e) => {
            let outage = matches!(e, UnitError::Write(WriteError::StoreUnavailable { .. }));
            (UnitStatus::Failed, Some(e.to_string()), outage)
        }
    };

    match &error {
        None => info!(records = progress.records, status = status.as_str(), "Work unit finished"),
        Some(e) => warn!(records = progress.records, status = status.as_str(), error = %e, "Work unit failed"),
    }
    crate::metrics::record_unit_outcome(status.as_str(), progress.records, started.elapsed());

    UnitResult {
        event: UnitEvent {
            channel_id: unit.channel_id,
            range: unit.range,
            kind: unit.kind,
            status,
            records: progress.records,
            error,
        },
        rejected: progress.rejected,
        partial: progress.partial,
        store_outage,
    }
}

/// `Ok(true)` when the unit completed, `Ok(false)` when stopped early.
async fn run_pages(
    ctx: &UnitContext,
    unit: &WorkUnit,
    stop: &StopSignal,
    progress: &mut Progress,
) -> Result<bool, UnitError> {
    let channel_id = unit.channel_id;

    let checkpoint = ctx
        .tracker
        .load_checkpoint(channel_id, &unit.range)
        .await?
        .filter(|cp| cp.direction == ctx.direction);
    let mut written_total = checkpoint.as_ref().map_or(0, |cp| cp.records_written);

    let stream = match checkpoint {
        Some(cp) => {
            // Walking back from the cursor never reaches events newer than
            // the old end; those get their own pass first.
            if ctx.direction == Direction::Descending && cp.range.end < unit.range.end {
                let tail = TimeRange::new(cp.range.end, unit.range.end);
                info!(%tail, "Unit grew since its checkpoint, crawling the new part");
                let tail_stream = ctx.crawler.crawl(channel_id, tail, ctx.direction);
                if !drain(ctx, unit, tail_stream, None, stop, progress, &mut written_total).await? {
                    return Ok(false);
                }
                ctx.tracker
                    .save_checkpoint(channel_id, unit.range, ctx.direction, cp.cursor, written_total)
                    .await?;
            }
            info!(cursor = cp.cursor, records_written = cp.records_written, "Resuming from checkpoint");
            ctx.crawler.resume(channel_id, unit.range, ctx.direction, cp.cursor)
        }
        None => ctx.crawler.crawl(channel_id, unit.range, ctx.direction),
    };

    if !drain(ctx, unit, stream, Some(unit.range), stop, progress, &mut written_total).await? {
        return Ok(false);
    }

    ctx.tracker.mark_complete(channel_id, unit.range).await?;
    ctx.tracker.clear_checkpoint(channel_id, &unit.range).await?;
    Ok(true)
}

/// Write every page of `stream`, saving a checkpoint under `checkpoint_range`
/// after each one when given. `Ok(false)` when stopped early.
async fn drain(
    ctx: &UnitContext,
    unit: &WorkUnit,
    mut stream: PageStream,
    checkpoint_range: Option<TimeRange>,
    stop: &StopSignal,
    progress: &mut Progress,
    written_total: &mut u64,
) -> Result<bool, UnitError> {
    let channel_id = unit.channel_id;
    let entity = channel_entity(channel_id);

    loop {
        if stop.is_set() {
            debug!(cursor = ?stream.cursor(), "Stopping at page boundary");
            return Ok(false);
        }
        let Some(page) = stream.next_page().await? else {
            return Ok(true);
        };

        if !page.rejected.is_empty() {
            for (raw_id, err) in &page.rejected {
                warn!(raw_id = %raw_id, error = %err, "Skipping malformed event");
            }
            crate::metrics::record_records_rejected("normalize", page.rejected.len());
            progress.rejected += page.rejected.len() as u64;
            let (raw_id, err) = &page.rejected[0];
            ctx.tracker
                .note_error(&entity, &format!("skipped malformed event {raw_id}: {err}"))
                .await?;
        }

        if !page.records.is_empty() {
            let outcome = ctx.writer.write_batch(&page.records, ctx.policy).await?;
            let written = outcome.written.len() as u64;
            if written > 0 {
                ctx.tracker.add_progress(&entity, written).await?;
            }
            progress.records += written;
            *written_total += written;

            if let Some(bad) = outcome.data_errors().next() {
                let count = outcome.data_errors().count() as u64;
                progress.rejected += count;
                ctx.tracker
                    .note_error(&entity, &format!("skipped invalid record {}: {}", bad.event_id, bad.reason))
                    .await?;
            }
            if !outcome.partial.is_empty() {
                progress.partial += outcome.partial.len() as u64;
                let message = match &outcome.reconcile_error {
                    Some(e) => format!(
                        "{} records missed the secondary store and could not be queued: {e}",
                        outcome.partial.len()
                    ),
                    None => format!(
                        "{} records missed the secondary store, queued for reconciliation",
                        outcome.partial.len()
                    ),
                };
                ctx.tracker.note_error(&entity, &message).await?;
            }
            if let Some(first) = outcome.store_errors().next() {
                // Records missing from the lead store: the range can't be complete.
                return Err(UnitError::StoreFailures {
                    store: ctx.policy.lead().as_str(),
                    count: outcome.store_errors().count(),
                    reason: first.reason.clone(),
                });
            };
        }

        let Some(cursor) = page.cursor else {
            return Ok(true);
        };
        if let Some(range) = checkpoint_range {
            ctx.tracker
                .save_checkpoint(channel_id, range, ctx.direction, cursor, *written_total)
                .await?;
        }
        if !ctx.inter_page_delay.is_zero() {
            ctx.clock.sleep(ctx.inter_page_delay).await;
        }
    }
}
