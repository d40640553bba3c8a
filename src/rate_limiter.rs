// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-resource token bucket rate limiting.
//!
//! Every outbound call (source fetches, store writes) takes a token from
//! the bucket for its resource key first. A bucket holds at most `burst`
//! tokens and refills at `rate_per_sec`, so over any window of `t`
//! seconds no more than `burst + rate_per_sec * t` calls get through.
//!
//! # Fairness and cancellation
//!
//! Waiters queue on a FIFO async mutex, so callers are served in arrival
//! order. A token is only deducted once a caller is actually let through:
//! dropping an `acquire` future mid-wait consumes nothing.
//!
//! # Adaptive backoff
//!
//! [`RateLimiter::backoff`] is called when the remote side says "slow down"
//! (HTTP 429). It blocks the bucket until the suggested time and halves the
//! effective refill rate. The rate is restored once a cooldown passes with
//! no further backoff signals.

use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Lowest fraction of the configured rate backoff can push a bucket to.
pub const MIN_RATE_FACTOR: f64 = 0.125;

/// Penalty applied when the remote side gives no retry-after.
pub const DEFAULT_PENALTY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimit {
    pub rate_per_sec: f64,
    pub burst: u32,
}

impl RateLimit {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            burst: burst.max(1),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    rate_factor: f64,
    last_backoff: Option<Instant>,
}

impl BucketState {
    /// Try to take a token at `now`. On refusal, returns how long to wait.
    fn poll(&mut self, now: Instant, limit: &RateLimit, cooldown: Duration) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let rate = limit.rate_per_sec * self.rate_factor;
        self.tokens = (self.tokens + elapsed * rate).min(limit.burst as f64);
        self.last_refill = now;

        if let Some(at) = self.last_backoff {
            if now.saturating_duration_since(at) >= cooldown {
                self.rate_factor = 1.0;
                self.last_backoff = None;
            }
        }

        if let Some(until) = self.blocked_until {
            if now < until {
                return Err(until - now);
            }
            self.blocked_until = None;
        }

        // Float refill can land a hair short of a whole token.
        if self.tokens >= 1.0 - 1e-9 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Ok(());
        }
        let rate = limit.rate_per_sec * self.rate_factor;
        Err(Duration::from_secs_f64((1.0 - self.tokens) / rate))
    }
}

struct Bucket {
    limit: RateLimit,
    gate: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<BucketState>,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    buckets: DashMap<String, Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            clock,
            cooldown,
            buckets: DashMap::new(),
        }
    }

    /// Register (or replace) the limit for a resource. Buckets start full.
    pub fn configure(&self, resource: &str, limit: RateLimit) {
        let state = BucketState {
            tokens: limit.burst as f64,
            last_refill: self.clock.now(),
            blocked_until: None,
            rate_factor: 1.0,
            last_backoff: None,
        };
        self.buckets.insert(
            resource.to_string(),
            Arc::new(Bucket {
                limit,
                gate: tokio::sync::Mutex::new(()),
                state: parking_lot::Mutex::new(state),
            }),
        );
    }

    fn bucket(&self, resource: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(resource).map(|b| b.value().clone())
    }

    /// Wait for permission to make one call against `resource`.
    ///
    /// Resources with no configured limit pass straight through.
    pub async fn acquire(&self, resource: &str) {
        let Some(bucket) = self.bucket(resource) else {
            return;
        };
        let _turn = bucket.gate.lock().await;
        let mut waited = Duration::ZERO;

        loop {
            let now = self.clock.now();
            let verdict = bucket.state.lock().poll(now, &bucket.limit, self.cooldown);
            match verdict {
                Ok(()) => {
                    if !waited.is_zero() {
                        crate::metrics::record_rate_limit_wait(resource, waited);
                    }
                    return;
                }
                Err(wait) => {
                    waited += wait;
                    self.clock.sleep(wait).await;
                }
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    /// Returns `false` on timeout, having consumed nothing.
    pub async fn acquire_timeout(&self, resource: &str, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.acquire(resource)).await.is_ok()
    }

    /// React to a "slow down" signal from `resource`.
    pub fn backoff(&self, resource: &str, suggested: Option<Duration>) {
        let Some(bucket) = self.bucket(resource) else {
            return;
        };
        let now = self.clock.now();
        let penalty = suggested.unwrap_or(DEFAULT_PENALTY);
        let factor = {
            let mut state = bucket.state.lock();
            let until = now + penalty;
            state.blocked_until = Some(state.blocked_until.map_or(until, |u| u.max(until)));
            state.rate_factor = (state.rate_factor * 0.5).max(MIN_RATE_FACTOR);
            state.last_backoff = Some(now);
            state.rate_factor
        };

        warn!(resource, ?penalty, rate_factor = factor, "Rate limited by remote, backing off");
        crate::metrics::record_rate_limit_backoff(resource);
        crate::metrics::set_rate_factor(resource, factor);
    }

    /// Current effective refill rate for `resource`, if configured.
    #[must_use]
    pub fn effective_rate(&self, resource: &str) -> Option<f64> {
        let bucket = self.bucket(resource)?;
        let now = self.clock.now();
        let mut state = bucket.state.lock();
        if let Some(at) = state.last_backoff {
            if now.saturating_duration_since(at) >= self.cooldown {
                state.rate_factor = 1.0;
                state.last_backoff = None;
                debug!(resource, "Rate restored after cooldown");
            }
        }
        Some(bucket.limit.rate_per_sec * state.rate_factor)
    }
}
