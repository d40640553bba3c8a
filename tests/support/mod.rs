//! Shared fixtures for integration tests: a scripted event source and a
//! store wrapper that can be switched off.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use archive_sync::config::ArchiveSyncConfig;
use archive_sync::event_record::{ChannelId, EventId, EventRecord, RawEvent};
use archive_sync::interval::{TimeRange, DAY_MILLIS};
use archive_sync::source::{ChannelInfo, Direction, EventSource, Page, PageRequest, SourceError};
use archive_sync::storage::memory::InMemoryStore;
use archive_sync::storage::traits::{BatchWriteResult, EventStore, StorageError};
use archive_sync::{BackfillScheduler, ManualClock, Stores, WritePolicy};

/// Wall clock used by scenarios: well after any test data.
pub const NOW: i64 = 30 * DAY_MILLIS;

pub fn raw_event(id: EventId, created_at: i64) -> RawEvent {
    RawEvent {
        id: id.to_string(),
        author_id: "7".into(),
        content: Some(format!("event {id}")),
        created_at: chrono::DateTime::from_timestamp_millis(created_at)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default(),
        ..Default::default()
    }
}

struct ScriptedChannel {
    created_at: i64,
    /// Keyed by event ID; IDs increase with `created_at`.
    events: BTreeMap<EventId, RawEvent>,
}

/// Deterministic in-memory source.
///
/// Event IDs are their creation timestamps, so ID order is time order.
/// Failures are scripted by global `fetch_page` call number (1-based).
#[derive(Default)]
pub struct ScriptedSource {
    channels: Mutex<HashMap<ChannelId, ScriptedChannel>>,
    failures: Mutex<HashMap<usize, SourceError>>,
    /// Channel -> number of its fetches served before it disappears.
    delete_after: Mutex<HashMap<ChannelId, usize>>,
    channel_fetches: Mutex<HashMap<ChannelId, usize>>,
    /// Run once while serving the given fetch, before anything else.
    hooks: Mutex<HashMap<usize, Box<dyn FnOnce() + Send>>>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel whose events sit at the given timestamps.
    pub fn with_channel(self, channel_id: ChannelId, created_at: i64, timestamps: impl IntoIterator<Item = i64>) -> Self {
        let events = timestamps
            .into_iter()
            .map(|ts| (ts as EventId, raw_event(ts as EventId, ts)))
            .collect();
        self.channels.lock().insert(channel_id, ScriptedChannel { created_at, events });
        self
    }

    /// Replace one event's raw form (e.g. with something malformed).
    pub fn replace_event(&self, channel_id: ChannelId, event_id: EventId, raw: RawEvent) {
        if let Some(ch) = self.channels.lock().get_mut(&channel_id) {
            ch.events.insert(event_id, raw);
        }
    }

    pub fn fail_fetch(&self, call: usize, error: SourceError) {
        self.failures.lock().insert(call, error);
    }

    pub fn delete_channel_after(&self, channel_id: ChannelId, fetches: usize) {
        self.delete_after.lock().insert(channel_id, fetches);
    }

    pub fn on_fetch(&self, call: usize, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().insert(call, Box::new(hook));
    }

    /// Flip `cancel` to `true` while serving fetch number `call`.
    pub fn cancel_during_fetch(&self, call: usize, cancel: watch::Sender<bool>) {
        self.on_fetch(call, move || {
            let _ = cancel.send(true);
        });
    }

    /// Take `store` down while serving fetch number `call`.
    pub fn take_down_during_fetch(&self, call: usize, store: Arc<SwitchableStore>) {
        self.on_fetch(call, move || store.set_down(true));
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn event_ids(&self, channel_id: ChannelId) -> BTreeSet<EventId> {
        self.channels
            .lock()
            .get(&channel_id)
            .map(|ch| ch.events.keys().copied().collect())
            .unwrap_or_default()
    }

    fn deleted(&self, channel_id: ChannelId) -> bool {
        let served = self.channel_fetches.lock().get(&channel_id).copied().unwrap_or(0);
        self.delete_after
            .lock()
            .get(&channel_id)
            .is_some_and(|limit| served >= *limit)
    }

    fn gone(channel_id: ChannelId) -> SourceError {
        SourceError::ChannelUnavailable {
            channel_id,
            reason: "not found".into(),
        }
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn channel_info(&self, channel_id: ChannelId) -> Result<ChannelInfo, SourceError> {
        if self.deleted(channel_id) {
            return Err(Self::gone(channel_id));
        }
        let channels = self.channels.lock();
        let ch = channels.get(&channel_id).ok_or_else(|| Self::gone(channel_id))?;
        Ok(ChannelInfo {
            channel_id,
            created_at: ch.created_at,
            name: Some(format!("channel-{channel_id}")),
        })
    }

    async fn fetch_page(&self, req: &PageRequest) -> Result<Page, SourceError> {
        let call = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let hook = self.hooks.lock().remove(&call);
        if let Some(hook) = hook {
            hook();
        }
        if let Some(err) = self.failures.lock().remove(&call) {
            return Err(err);
        }
        if self.deleted(req.channel_id) {
            return Err(Self::gone(req.channel_id));
        }
        *self.channel_fetches.lock().entry(req.channel_id).or_insert(0) += 1;

        let channels = self.channels.lock();
        let ch = channels.get(&req.channel_id).ok_or_else(|| Self::gone(req.channel_id))?;
        let lo = req.range.start.max(1) as EventId;
        let hi = req.range.end.max(1) as EventId;
        let in_range = ch.events.range(lo..hi).filter(|(id, _)| match (req.direction, req.cursor) {
            (_, None) => true,
            (Direction::Ascending, Some(c)) => **id > c,
            (Direction::Descending, Some(c)) => **id < c,
        });
        let mut page: Vec<(EventId, RawEvent)> = match req.direction {
            Direction::Ascending => in_range.map(|(id, e)| (*id, e.clone())).collect(),
            Direction::Descending => in_range.rev().map(|(id, e)| (*id, e.clone())).collect(),
        };
        let more = page.len() > req.limit;
        page.truncate(req.limit);
        Ok(Page {
            next_cursor: if more { page.last().map(|(id, _)| *id) } else { None },
            events: page.into_iter().map(|(_, e)| e).collect(),
        })
    }
}

/// Store wrapper that can be taken down, or made to reject given records.
pub struct SwitchableStore {
    pub inner: Arc<InMemoryStore>,
    down: AtomicBool,
    poison: Mutex<BTreeSet<EventId>>,
}

impl SwitchableStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(InMemoryStore::named(name)),
            down: AtomicBool::new(false),
            poison: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn poison(&self, event_id: EventId) {
        self.poison.lock().insert(event_id);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable(format!("{} is down", self.inner.name())))
        } else {
            Ok(())
        }
    }

    fn check_record(&self, record: &EventRecord) -> Result<(), StorageError> {
        if self.poison.lock().contains(&record.event_id) {
            return Err(StorageError::InvalidRecord {
                event_id: record.event_id,
                reason: "rejected by store".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for SwitchableStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn upsert(&self, record: &EventRecord) -> Result<(), StorageError> {
        self.check()?;
        self.check_record(record)?;
        self.inner.upsert(record).await
    }

    async fn upsert_batch(&self, records: &[EventRecord]) -> Result<BatchWriteResult, StorageError> {
        self.check()?;
        for record in records {
            self.check_record(record)?;
        }
        self.inner.upsert_batch(records).await
    }

    async fn get(&self, event_id: EventId) -> Result<Option<EventRecord>, StorageError> {
        self.check()?;
        self.inner.get(event_id).await
    }

    async fn range(&self, channel_id: ChannelId, range: TimeRange, limit: usize) -> Result<Vec<EventRecord>, StorageError> {
        self.check()?;
        self.inner.range(channel_id, range, limit).await
    }

    async fn count_range(&self, channel_id: ChannelId, range: TimeRange) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.count_range(channel_id, range).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }
}

/// Small pages, two workers, fast retries.
pub fn test_config(policy: WritePolicy) -> ArchiveSyncConfig {
    ArchiveSyncConfig {
        write_policy: policy,
        worker_count: 2,
        page_size: 50,
        write_batch_size: 50,
        retry_base_ms: 100,
        retry_max_ms: 2_000,
        ..Default::default()
    }
}

pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub primary: Arc<SwitchableStore>,
    pub secondary: Arc<SwitchableStore>,
    /// Coverage, status, checkpoints and the reconcile queue.
    pub state: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(source: ScriptedSource) -> Self {
        let primary = Arc::new(SwitchableStore::new("primary"));
        Self {
            source: Arc::new(source),
            state: primary.inner.clone(),
            primary,
            secondary: Arc::new(SwitchableStore::new("secondary")),
            clock: Arc::new(ManualClock::new(NOW)),
        }
    }

    pub fn scheduler(&self, config: ArchiveSyncConfig) -> BackfillScheduler {
        let secondary = match config.write_policy {
            WritePolicy::PrimaryOnly => None,
            _ => Some(self.secondary.clone() as Arc<dyn EventStore>),
        };
        let stores = Stores {
            primary: self.primary.clone(),
            secondary,
            state: self.state.clone(),
        };
        BackfillScheduler::new(config, self.source.clone(), stores, self.clock.clone())
            .unwrap_or_else(|e| panic!("invalid test config: {e}"))
    }
}

/// `count` timestamps spread unevenly over `[start, end)`: dense at the
/// start, sparse later. Strictly increasing and unique.
pub fn uneven_timestamps(start: i64, end: i64, count: usize) -> Vec<i64> {
    let span = (end - start) as f64;
    (0..count)
        .map(|i| {
            let x = (i as f64 + 0.5) / count as f64;
            start + (span * x * x) as i64 + i as i64
        })
        .collect()
}

/// `count` timestamps evenly spaced in `[start, end)`.
pub fn even_timestamps(start: i64, end: i64, count: usize) -> Vec<i64> {
    let step = (end - start) / count as i64;
    (0..count as i64).map(|i| start + step / 2 + i * step).collect()
}
