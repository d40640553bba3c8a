// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backfill scheduler.
//!
//! The [`BackfillScheduler`] is the orchestrator that ties together all components:
//! - Gap detection per channel
//! - Work unit planning and prioritisation
//! - A bounded pool of unit tasks crawling through the rate limiter
//! - Dual-store writes with reconciliation
//! - Durable coverage, status and checkpoints
//!
//! # Run phases
//!
//! ```text
//! Idle → Preflight → Reconciling → Planning → Backfilling → Finished
//! ```
//!
//! Only preflight failures (bad config, every targeted store unreachable)
//! and losing every targeted store mid-run abort a run. Everything else is
//! contained to its unit or channel and reported in the [`RunSummary`].
//!
//! # Example
//!
//! ```rust,no_run
//! use archive_sync::{ArchiveSyncConfig, BackfillScheduler, SyncMode, TimeRange};
//! # use archive_sync::source::EventSource;
//! # use std::sync::Arc;
//! # async fn example(source: Arc<dyn EventSource>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ArchiveSyncConfig::from_toml_str(r#"
//!     primary_url = "sqlite:archive.db?mode=rwc"
//!     secondary_url = "redis://localhost:6379"
//! "#)?;
//! let scheduler = BackfillScheduler::connect(config, source, Arc::new(archive_sync::TokioClock)).await?;
//!
//! let summary = scheduler
//!     .run(&[1234, 5678], TimeRange::new(0, i64::MAX), SyncMode::FastFill)
//!     .await?;
//! println!("{summary}");
//! std::process::exit(summary.outcome().exit_code());
//! # }
//! ```

mod plan;
mod types;
mod unit;

pub use plan::{plan_units, sort_units};
pub use types::{
    RunError, RunOutcome, RunPhase, RunSummary, ScheduleOrder, UnitEvent, UnitKind, UnitStatus, WorkUnit,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{ArchiveSyncConfig, ConfigError};
use crate::crawler::{CrawlError, Crawler};
use crate::event_record::ChannelId;
use crate::gap_detector::{GapDetector, GapError, SyncMode};
use crate::interval::TimeRange;
use crate::rate_limiter::RateLimiter;
use crate::resilience::circuit_breaker::StoreCircuits;
use crate::resilience::reconcile::ReconcileQueue;
use crate::source::{EventSource, SOURCE_RESOURCE};
use crate::storage::traits::{EventStore, StateStore};
use crate::sync_state::{channel_entity, StateError, SyncStateTracker};
use crate::writer::{DualStoreWriter, StoreRole, WritePolicy};

use unit::{process_unit, StopSignal, UnitContext, UnitResult};

/// The stores a scheduler writes to.
#[derive(Clone)]
pub struct Stores {
    pub primary: Arc<dyn EventStore>,
    pub secondary: Option<Arc<dyn EventStore>>,
    /// Coverage, status, checkpoints and the reconciliation queue.
    pub state: Arc<dyn StateStore>,
}

/// Per-channel bookkeeping during dispatch.
#[derive(Default)]
struct ChannelProgress {
    remaining: usize,
    error: Option<String>,
    stopped: bool,
}

pub struct BackfillScheduler {
    config: ArchiveSyncConfig,
    stores: Stores,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    tracker: Arc<SyncStateTracker>,
    writer: Arc<DualStoreWriter>,
    detector: GapDetector,
    units: Arc<UnitContext>,
    phase: watch::Sender<RunPhase>,
    phase_rx: watch::Receiver<RunPhase>,
    events: broadcast::Sender<UnitEvent>,
    running: AtomicBool,
}

impl BackfillScheduler {
    /// Build a scheduler over already-connected stores.
    pub fn new(
        config: ArchiveSyncConfig,
        source: Arc<dyn EventSource>,
        stores: Stores,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::with_circuits(config, source, stores, clock, StoreCircuits::new())
    }

    pub fn with_circuits(
        config: ArchiveSyncConfig,
        source: Arc<dyn EventSource>,
        stores: Stores,
        clock: Arc<dyn Clock>,
        circuits: StoreCircuits,
    ) -> Result<Self, ConfigError> {
        config.validate_tunables()?;
        if config.write_policy != WritePolicy::PrimaryOnly && stores.secondary.is_none() {
            return Err(ConfigError::Invalid {
                field: "secondary_url",
                reason: format!("is required for write policy '{}'", config.write_policy),
            });
        }

        let limiter = Arc::new(RateLimiter::new(
            clock.clone(),
            Duration::from_secs(config.backoff_cooldown_secs),
        ));
        limiter.configure(SOURCE_RESOURCE, config.source_limit());
        limiter.configure(StoreRole::Primary.as_str(), config.store_limit());
        if stores.secondary.is_some() {
            limiter.configure(StoreRole::Secondary.as_str(), config.store_limit());
        }

        let crawler = Crawler::new(
            source,
            limiter.clone(),
            clock.clone(),
            config.retry_config(),
            config.page_size,
        );
        let tracker = Arc::new(SyncStateTracker::new(
            stores.state.clone(),
            clock.clone(),
            Duration::from_secs(config.max_run_duration_secs),
        ));
        let reconcile = Arc::new(ReconcileQueue::new(stores.state.clone(), clock.clone()));
        let writer = Arc::new(DualStoreWriter::new(
            stores.primary.clone(),
            stores.secondary.clone(),
            circuits,
            limiter.clone(),
            reconcile,
            config.write_batch_size,
        ));
        let detector = GapDetector::new(
            tracker.clone(),
            stores.primary.clone(),
            crawler.clone(),
            clock.clone(),
            config.gap_config(),
        );
        let units = Arc::new(UnitContext {
            crawler,
            tracker: tracker.clone(),
            writer: writer.clone(),
            clock: clock.clone(),
            policy: config.write_policy,
            direction: config.order.direction(),
            inter_page_delay: Duration::from_millis(config.inter_page_delay_ms),
        });

        let (phase, phase_rx) = watch::channel(RunPhase::Idle);
        let (events, _) = broadcast::channel(1024);

        Ok(Self {
            config,
            stores,
            clock,
            limiter,
            tracker,
            writer,
            detector,
            units,
            phase,
            phase_rx,
            events,
            running: AtomicBool::new(false),
        })
    }

    /// Connect the stores named in `config` and build a scheduler over them.
    pub async fn connect(
        config: ArchiveSyncConfig,
        source: Arc<dyn EventSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RunError> {
        config.validate()?;
        let prefix = config.redis_prefix.as_deref();

        let primary_url = config.primary_url.as_deref().unwrap_or_default();
        info!(url = %primary_url, "Connecting primary store");
        let primary = crate::storage::connect(primary_url, prefix, "primary")
            .await
            .map_err(RunError::Connect)?;

        let secondary = match config.secondary_url.as_deref() {
            Some(url) if config.write_policy != WritePolicy::PrimaryOnly => {
                info!(url = %url, "Connecting secondary store");
                match crate::storage::connect(url, prefix, "secondary").await {
                    Ok(backend) => Some(backend.events),
                    // A down secondary degrades to partial writes; it doesn't block startup.
                    Err(e) if config.write_policy == WritePolicy::Both => {
                        warn!(error = %e, "Secondary store unavailable at startup, writes will be queued");
                        None
                    }
                    Err(e) => return Err(RunError::Connect(e)),
                }
            }
            _ => None,
        };
        let secondary = match secondary {
            Some(s) => Some(s),
            None if config.write_policy == WritePolicy::Both => {
                Some(Arc::new(crate::storage::Unreachable::new("secondary")) as Arc<dyn EventStore>)
            }
            None => None,
        };

        let stores = Stores {
            primary: primary.events,
            secondary,
            state: primary.state,
        };
        Ok(Self::new(config, source, stores, clock)?)
    }

    #[must_use]
    pub fn config(&self) -> &ArchiveSyncConfig {
        &self.config
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<SyncStateTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn writer(&self) -> &Arc<DualStoreWriter> {
        &self.writer
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn detector(&self) -> &GapDetector {
        &self.detector
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        *self.phase_rx.borrow()
    }

    #[must_use]
    pub fn phase_receiver(&self) -> watch::Receiver<RunPhase> {
        self.phase_rx.clone()
    }

    /// Per-unit completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.events.subscribe()
    }

    /// Run to completion.
    pub async fn run(
        &self,
        channels: &[ChannelId],
        range: TimeRange,
        mode: SyncMode,
    ) -> Result<RunSummary, RunError> {
        let (_tx, rx) = watch::channel(false);
        self.run_until(channels, range, mode, rx).await
    }

    /// Run until done or until `cancel` turns `true`.
    ///
    /// Cancellation is observed at page boundaries: in-flight pages finish,
    /// no new page is fetched, and coverage holds exactly the units that
    /// completed.
    #[tracing::instrument(skip(self, channels, cancel), fields(channels = channels.len(), mode = mode.as_str()))]
    pub async fn run_until(
        &self,
        channels: &[ChannelId],
        range: TimeRange,
        mode: SyncMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunSummary, RunError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RunError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        let started = Instant::now();

        let result = self.run_inner(channels, range, mode, StopSignal::new(cancel)).await;
        let _ = self.phase.send(RunPhase::Finished);
        match result {
            Ok(mut summary) => {
                summary.elapsed = started.elapsed();
                crate::metrics::record_run(summary.outcome().as_str(), summary.elapsed);
                info!(%summary, "Run finished");
                Ok(summary)
            }
            Err(e) => {
                crate::metrics::record_run("aborted", started.elapsed());
                error!(error = %e, "Run aborted");
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        channels: &[ChannelId],
        range: TimeRange,
        mode: SyncMode,
        stop: StopSignal,
    ) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary {
            channels: channels.len(),
            ..Default::default()
        };

        // ========== PHASE 1: Preflight ==========
        let _ = self.phase.send(RunPhase::Preflight);
        self.config.validate_tunables()?;
        self.check_stores().await?;

        // ========== PHASE 2: Reconcile earlier partial writes ==========
        let _ = self.phase.send(RunPhase::Reconciling);
        summary.reconciled = self.drain_reconcile().await;

        // ========== PHASE 3: Gap detection and planning ==========
        let _ = self.phase.send(RunPhase::Planning);
        let mut progress: HashMap<ChannelId, ChannelProgress> = HashMap::new();
        let mut units = Vec::new();
        for &channel_id in channels {
            if stop.is_set() {
                summary.skipped_channels.push((channel_id, "run cancelled".into()));
                continue;
            }
            if progress.contains_key(&channel_id) {
                continue;
            }
            match self.plan_channel(channel_id, range, mode).await {
                Ok(PlanResult::Units(planned)) => {
                    progress.insert(
                        channel_id,
                        ChannelProgress {
                            remaining: planned.len(),
                            ..Default::default()
                        },
                    );
                    units.extend(planned);
                }
                Ok(PlanResult::Done) => {}
                Ok(PlanResult::Skipped(reason)) => summary.skipped_channels.push((channel_id, reason)),
                Err(reason) => summary.failed_channels.push((channel_id, reason)),
            }
        }
        sort_units(&mut units);
        info!(units = units.len(), channels = progress.len(), "Planned work units");

        // ========== PHASE 4: Dispatch ==========
        let _ = self.phase.send(RunPhase::Backfilling);
        let abort_reason = self.dispatch(units, &stop, &mut progress, &mut summary).await;

        // ========== PHASE 5: Settle channel status ==========
        let cancelled = stop.is_cancelled();
        for (channel_id, p) in progress {
            let entity = channel_entity(channel_id);
            let result = match (&p.error, p.stopped || p.remaining > 0) {
                (Some(e), _) => self.tracker.fail(&entity, e).await,
                (None, true) => {
                    let reason = if cancelled { "run cancelled" } else { "run aborted" };
                    self.tracker.release(&entity, reason).await
                }
                (None, false) => self.tracker.commit(&entity, 0).await,
            };
            if let Err(e) = result {
                warn!(channel_id, error = %e, "Failed to record final channel status");
            }
        }

        if let Some(reason) = abort_reason {
            return Err(RunError::StoresUnreachable(reason));
        }
        summary.cancelled = cancelled;
        Ok(summary)
    }

    /// Fail the run if no store the policy writes to answers a ping.
    async fn check_stores(&self) -> Result<(), RunError> {
        let mut reachable = 0;
        let mut errors = Vec::new();
        for role in self.config.write_policy.targets() {
            let store = match role {
                StoreRole::Primary => Some(&self.stores.primary),
                StoreRole::Secondary => self.stores.secondary.as_ref(),
            };
            let Some(store) = store else {
                continue;
            };
            match store.ping().await {
                Ok(()) => {
                    crate::metrics::set_store_healthy(role.as_str(), true);
                    reachable += 1;
                }
                Err(e) => {
                    crate::metrics::set_store_healthy(role.as_str(), false);
                    warn!(store = role.as_str(), error = %e, "Store unreachable");
                    errors.push(format!("{}: {e}", role.as_str()));
                }
            }
        }
        if reachable == 0 {
            return Err(RunError::StoresUnreachable(errors.join("; ")));
        }
        Ok(())
    }

    /// Repair queued secondary copies. Failures are logged, never fatal.
    async fn drain_reconcile(&self) -> usize {
        if self.config.write_policy != WritePolicy::Both {
            return 0;
        }
        let Some(secondary) = &self.stores.secondary else {
            return 0;
        };
        let queue = self.writer.reconcile();
        let mut repaired = 0;
        loop {
            match queue
                .drain(self.stores.primary.as_ref(), secondary.as_ref(), self.config.reconcile_batch_size)
                .await
            {
                Ok(report) => {
                    repaired += report.repaired.len();
                    if report.is_empty() || !report.failed.is_empty() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Reconciliation drain failed");
                    break;
                }
            }
        }
        repaired
    }

    async fn plan_channel(
        &self,
        channel_id: ChannelId,
        range: TimeRange,
        mode: SyncMode,
    ) -> Result<PlanResult, String> {
        let entity = channel_entity(channel_id);
        match self.tracker.begin(&entity).await {
            Ok(_) => {}
            Err(e @ StateError::AlreadyRunning { .. }) => {
                warn!(channel_id, error = %e, "Skipping channel");
                return Ok(PlanResult::Skipped(e.to_string()));
            }
            Err(e) => {
                warn!(channel_id, error = %e, "Could not start channel");
                return Ok(PlanResult::Skipped(e.to_string()));
            }
        }

        let report = match self.detector.find_gaps(channel_id, range, mode).await {
            Ok(report) => report,
            Err(e) => {
                let message = match &e {
                    GapError::Crawl(CrawlError::ChannelUnavailable { .. }) => {
                        warn!(channel_id, error = %e, "Channel unavailable, excluding from run");
                        e.to_string()
                    }
                    _ => {
                        warn!(channel_id, error = %e, "Gap detection failed");
                        format!("gap detection failed: {e}")
                    }
                };
                if let Err(se) = self.tracker.fail(&entity, &message).await {
                    warn!(channel_id, error = %se, "Failed to record channel failure");
                }
                return Err(message);
            }
        };

        if report.is_empty() {
            debug!(channel_id, "Nothing to backfill");
            if let Err(e) = self.tracker.commit(&entity, 0).await {
                warn!(channel_id, error = %e, "Failed to record channel status");
            }
            return Ok(PlanResult::Done);
        }
        Ok(PlanResult::Units(plan_units(
            &report,
            mode,
            self.config.order,
            self.config.max_unit_span_millis(),
        )))
    }

    /// Run units through the worker pool. Returns the reason if the run
    /// had to abort.
    async fn dispatch(
        &self,
        units: Vec<WorkUnit>,
        stop: &StopSignal,
        progress: &mut HashMap<ChannelId, ChannelProgress>,
        summary: &mut RunSummary,
    ) -> Option<String> {
        let mut queue: VecDeque<WorkUnit> = units.into();
        let mut dead: HashSet<ChannelId> = HashSet::new();
        let mut tasks: JoinSet<UnitResult> = JoinSet::new();
        let permits = Arc::new(Semaphore::new(self.config.worker_count));
        let mut abort_reason = None;

        loop {
            while !stop.is_set() {
                let Some(front) = queue.front() else {
                    break;
                };
                if dead.contains(&front.channel_id) {
                    if let Some(unit) = queue.pop_front() {
                        self.skip(unit, "channel unavailable", progress, summary);
                    }
                    continue;
                }
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    break;
                };
                let Some(unit) = queue.pop_front() else {
                    break;
                };
                let ctx = self.units.clone();
                let stop = stop.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    process_unit(ctx, unit, stop).await
                });
                crate::metrics::set_active_units(tasks.len());
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            crate::metrics::set_active_units(tasks.len());
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // Its channel keeps a unit outstanding and is released, not committed.
                    error!(error = %e, "Work unit task panicked");
                    summary.panicked += 1;
                    continue;
                }
            };

            if result.store_outage && abort_reason.is_none() {
                if let Err(RunError::StoresUnreachable(reason)) = self.check_stores().await {
                    error!(%reason, "All targeted stores unreachable, aborting run");
                    stop.abort();
                    abort_reason = Some(reason);
                }
            }
            self.settle(result, stop, &mut dead, progress, summary).await;
        }

        // Whatever never started.
        let reason = if stop.is_aborted() { "run aborted" } else { "run cancelled" };
        while let Some(unit) = queue.pop_front() {
            let why = if dead.contains(&unit.channel_id) { "channel unavailable" } else { reason };
            self.skip(unit, why, progress, summary);
        }
        abort_reason
    }

    async fn settle(
        &self,
        result: UnitResult,
        stop: &StopSignal,
        dead: &mut HashSet<ChannelId>,
        progress: &mut HashMap<ChannelId, ChannelProgress>,
        summary: &mut RunSummary,
    ) {
        let event = result.event;
        summary.records_synced += event.records;
        summary.records_rejected += result.rejected;
        summary.records_partial += result.partial;

        let channel_id = event.channel_id;
        let entry = progress.entry(channel_id).or_default();
        entry.remaining = entry.remaining.saturating_sub(1);

        match event.status {
            UnitStatus::Succeeded => summary.completed.push(event.clone()),
            // The channel is released with the aborted run, not failed.
            UnitStatus::Failed if result.store_outage && stop.is_aborted() => {
                entry.stopped = true;
                summary.failed.push(event.clone());
            }
            UnitStatus::Cancelled | UnitStatus::Skipped => {
                entry.stopped = true;
                summary.skipped.push(event.clone());
            }
            UnitStatus::Failed | UnitStatus::ChannelUnavailable => {
                if event.status == UnitStatus::ChannelUnavailable {
                    dead.insert(channel_id);
                }
                let message = event.error.clone().unwrap_or_else(|| "unknown error".into());
                if entry.error.is_none() {
                    entry.error = Some(message.clone());
                    // Visible immediately, not just at the end of the run.
                    if let Err(e) = self.tracker.fail(&channel_entity(channel_id), &message).await {
                        warn!(channel_id, error = %e, "Failed to record unit failure");
                    }
                }
                summary.failed.push(event.clone());
            }
        }
        let _ = self.events.send(event);
    }

    fn skip(
        &self,
        unit: WorkUnit,
        reason: &str,
        progress: &mut HashMap<ChannelId, ChannelProgress>,
        summary: &mut RunSummary,
    ) {
        let entry = progress.entry(unit.channel_id).or_default();
        entry.remaining = entry.remaining.saturating_sub(1);
        entry.stopped = true;
        let event = UnitEvent {
            channel_id: unit.channel_id,
            range: unit.range,
            kind: unit.kind,
            status: UnitStatus::Skipped,
            records: 0,
            error: Some(reason.to_string()),
        };
        crate::metrics::record_unit_outcome(UnitStatus::Skipped.as_str(), 0, Duration::ZERO);
        let _ = self.events.send(event.clone());
        summary.skipped.push(event);
    }

    /// Wall-clock "now" as seen by this scheduler, epoch ms.
    #[must_use]
    pub fn now_millis(&self) -> i64 {
        self.clock.wall_millis()
    }
}

enum PlanResult {
    Units(Vec<WorkUnit>),
    /// Nothing to do; channel already committed.
    Done,
    Skipped(String),
}

/// RAII guard to reset the running flag.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
