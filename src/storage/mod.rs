//! Archive store backends.
//!
//! - [`memory`]: DashMap-backed store for tests and dry runs
//! - [`sql`]: SQLite / MySQL via the sqlx `Any` driver
//! - [`redis`]: Redis, JSON documents plus per-channel sorted-set indexes
//!
//! All of them implement both [`traits::EventStore`] and [`traits::StateStore`].

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

use async_trait::async_trait;
use std::sync::Arc;

use crate::event_record::{ChannelId, EventId, EventRecord};
use crate::interval::TimeRange;
use traits::{EventStore, StateStore, StorageError};

/// A connected backend, viewed through both traits.
#[derive(Clone)]
pub struct Backend {
    pub events: Arc<dyn EventStore>,
    pub state: Arc<dyn StateStore>,
}

impl Backend {
    fn of<S: EventStore + StateStore + 'static>(store: S) -> Self {
        let store = Arc::new(store);
        Self {
            events: store.clone(),
            state: store,
        }
    }
}

/// Connect a backend by URL scheme: `sqlite:`/`mysql:` or `redis:`/`rediss:`.
/// `memory:` gives a fresh in-memory store.
pub async fn connect(url: &str, prefix: Option<&str>, name: &str) -> Result<Backend, StorageError> {
    let scheme = url.split(':').next().unwrap_or_default();
    match scheme {
        "sqlite" | "mysql" => Ok(Backend::of(sql::SqlEventStore::connect(url, name).await?)),
        "redis" | "rediss" => Ok(Backend::of(redis::RedisEventStore::with_prefix(url, prefix, name).await?)),
        "memory" => Ok(Backend::of(memory::InMemoryStore::named(name))),
        other => Err(StorageError::Backend(format!("unsupported store URL scheme '{other}'"))),
    }
}

/// Stand-in for a store that could not be reached at startup.
///
/// Every call fails with [`StorageError::Unavailable`], so writes aimed at
/// it are queued for reconciliation instead of failing the run.
pub struct Unreachable {
    name: String,
}

impl Unreachable {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn err(&self) -> StorageError {
        StorageError::Unavailable(format!("{} store was unreachable at startup", self.name))
    }
}

#[async_trait]
impl EventStore for Unreachable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, _record: &EventRecord) -> Result<(), StorageError> {
        Err(self.err())
    }

    async fn get(&self, _event_id: EventId) -> Result<Option<EventRecord>, StorageError> {
        Err(self.err())
    }

    async fn range(
        &self,
        _channel_id: ChannelId,
        _range: TimeRange,
        _limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        Err(self.err())
    }

    async fn count_range(&self, _channel_id: ChannelId, _range: TimeRange) -> Result<u64, StorageError> {
        Err(self.err())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Err(self.err())
    }
}
