// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff and jitter.
//!
//! Two shapes are provided:
//! - [`retry`] wraps a closure and sleeps on the tokio timer. Storage
//!   backends use it around individual queries.
//! - [`Backoff`] is the bare delay state machine. The crawler drives it
//!   itself so it can classify errors, honour server-suggested delays and
//!   sleep on an injected clock.
//!
//! # Example
//!
//! ```
//! use archive_sync::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Daemon: never give up on reconnection
//! let daemon = RetryConfig::daemon();
//! assert_eq!(daemon.max_retries, None);
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// `max_retries` counts attempts in total, so `Some(3)` means the
/// operation runs at most three times. `None` retries forever.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
    /// Relative jitter applied to each delay, `0.1` means ±10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Infinite retry for long-running reconnection.
    /// Retries forever with exponential backoff capped at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Multi-row writes: a little more patience than a single query.
    #[must_use]
    pub fn batch_write() -> Self {
        Self {
            max_retries: Some(4),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Source API calls: 1s base, doubling to a 64s cap, 5 attempts.
    #[must_use]
    pub fn source() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

/// Exponential backoff state for one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempts: usize,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        let next_delay = config.initial_delay;
        Self {
            config,
            attempts: 0,
            next_delay,
        }
    }

    /// Failed attempts recorded so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    #[must_use]
    pub fn max_retries(&self) -> Option<usize> {
        self.config.max_retries
    }

    /// Record a failure and return how long to wait before the next
    /// attempt, or `None` once attempts are exhausted.
    ///
    /// A `hint` (e.g. a server's retry-after) is a floor on the delay.
    pub fn next_delay<R: Rng>(
        &mut self,
        rng: &mut R,
        hint: Option<Duration>,
    ) -> Option<Duration> {
        self.attempts += 1;
        if let Some(max) = self.config.max_retries {
            if self.attempts >= max {
                return None;
            }
        }

        let base = self.next_delay;
        self.next_delay = base.mul_f64(self.config.factor).min(self.config.max_delay);

        let jittered = if self.config.jitter > 0.0 {
            let spread = self.config.jitter.min(1.0);
            base.mul_f64(1.0 + rng.gen_range(-spread..=spread))
        } else {
            base
        };
        let delay = jittered.min(self.config.max_delay);
        Some(match hint {
            Some(h) => delay.max(h),
            None => delay,
        })
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = self.config.initial_delay;
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_: &E| true, operation).await
}

/// Like [`retry`], but errors for which `retryable` is false are returned
/// straight away.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = Backoff::new(config.clone());

    loop {
        match operation().await {
            Ok(val) => {
                if backoff.attempts() > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, backoff.attempts());
                }
                return Ok(val);
            }
            Err(err) if !retryable(&err) => return Err(err),
            Err(err) => {
                let Some(delay) = backoff.next_delay(&mut rand::thread_rng(), None) else {
                    return Err(err);
                };

                match config.max_retries {
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, backoff.attempts(), err, delay
                    ),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, backoff.attempts(), max, err, delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
