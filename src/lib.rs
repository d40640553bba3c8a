//! # Archive Sync
//!
//! An archive synchronization engine: finds what is missing from a local
//! archive of channel events, crawls it from a rate-limited remote source,
//! and writes it idempotently into one or two stores.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     BackfillScheduler                       │
//! │  • Preflight: validate config, ping targeted stores        │
//! │  • Drain the reconciliation queue                          │
//! │  • Plan work units, dispatch through a bounded pool        │
//! └─────────────────────────────────────────────────────────────┘
//!          │ per channel                        │ per unit
//!          ▼                                    ▼
//! ┌──────────────────────┐        ┌─────────────────────────────┐
//! │     GapDetector      │        │          Crawler            │
//! │  • window - coverage │        │  • Lazy page stream         │
//! │  • fast_fill merging │        │  • Token bucket per source  │
//! │  • thorough sampling │        │  • Retry with backoff       │
//! └──────────────────────┘        └─────────────────────────────┘
//!                                               │ pages
//!                                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DualStoreWriter                          │
//! │  • Upsert by event_id (idempotent)                         │
//! │  • Per-store circuit breakers                              │
//! │  • Partial writes → reconciliation queue                   │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌──────────────────────┐        ┌─────────────────────────────┐
//! │  Primary (SQL/Redis) │        │  Secondary (Redis/SQL)      │
//! │  + coverage, status, │        │                             │
//! │    checkpoints       │        │                             │
//! └──────────────────────┘        └─────────────────────────────┘
//! ```
//!
//! Coverage only ever grows, and only after a unit's last page is durable.
//! Checkpoints let an interrupted unit resume from its last written page.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archive_sync::{ArchiveSyncConfig, BackfillScheduler, SyncMode, TimeRange, TokioClock};
//! use archive_sync::source::EventSource;
//! use std::sync::Arc;
//!
//! # async fn example(source: Arc<dyn EventSource>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ArchiveSyncConfig::from_toml_str(r#"
//!     primary_url = "sqlite:archive.db?mode=rwc"
//!     secondary_url = "redis://localhost:6379"
//!     write_policy = "both"
//!     mode = "fast_fill"
//! "#)?;
//!
//! let scheduler = BackfillScheduler::connect(config, source, Arc::new(TokioClock)).await?;
//! let summary = scheduler
//!     .run(&[1234], TimeRange::new(0, i64::MAX), SyncMode::FastFill)
//!     .await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`scheduler`]: The [`BackfillScheduler`] orchestrating a run
//! - [`gap_detector`]: Coverage gaps and thorough-mode verification
//! - [`crawler`]: Paged, rate-limited, retried source crawling
//! - [`writer`]: Dual-store writes and write policies
//! - [`sync_state`]: Coverage, status and checkpoint bookkeeping
//! - [`storage`]: Store backends (SQL, Redis, memory)
//! - [`resilience`]: Retry, circuit breakers, reconciliation queue
//! - [`parity`]: Cross-store consistency checks
//! - [`rate_limiter`]: Token buckets with adaptive backoff

pub mod clock;
pub mod config;
pub mod crawler;
pub mod event_record;
pub mod gap_detector;
pub mod interval;
pub mod metrics;
pub mod parity;
pub mod rate_limiter;
pub mod resilience;
pub mod scheduler;
pub mod snowflake;
pub mod source;
pub mod storage;
pub mod sync_state;
pub mod writer;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{ArchiveSyncConfig, ConfigError};
pub use crawler::{CrawlError, Crawler, PageStream};
pub use event_record::{normalize, ChannelId, EventId, EventRecord, RawEvent, RecordError};
pub use gap_detector::{GapDetector, GapReport, SyncMode};
pub use interval::{IntervalSet, TimeRange};
pub use metrics::LatencyTimer;
pub use parity::{ParityChecker, ParityReport};
pub use rate_limiter::{RateLimit, RateLimiter};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, StoreCircuits};
pub use resilience::reconcile::{ReconcileEntry, ReconcileQueue};
pub use resilience::retry::RetryConfig;
pub use scheduler::{
    BackfillScheduler, RunError, RunOutcome, RunPhase, RunSummary, ScheduleOrder, Stores, UnitEvent, UnitStatus,
};
pub use source::{Direction, EventSource, SourceError};
pub use storage::traits::{EventStore, StateStore, StorageError};
pub use sync_state::{SyncState, SyncStateTracker, SyncStatus};
pub use writer::{DualStoreWriter, WriteOutcome, WritePolicy};
