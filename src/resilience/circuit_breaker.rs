// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-store outage breakers on top of the recloser crate.
//!
//! A breaker only reacts to store outages ([`StorageError::Unavailable`]).
//! A record the store rejects says nothing about the store's health, so it
//! passes through without touching the breaker state.
//!
//! After `outage_threshold` consecutive outages the breaker opens and every
//! call fails fast with `Unavailable("circuit open")` until
//! `recovery_timeout` elapses. It then lets `recovery_calls` trial calls
//! through and closes again if they land.

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::traits::StorageError;

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive outages that open the breaker.
    pub outage_threshold: u32,
    /// Trial calls let through after the recovery wait.
    pub recovery_calls: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            outage_threshold: 5,
            recovery_calls: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            outage_threshold: 2,
            recovery_calls: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    fn recloser(&self) -> Recloser {
        let window = self.outage_threshold.max(1);
        // Trips only when every call in the window was an outage.
        let rate = (window as f32 - 0.5) / window as f32;
        Recloser::custom()
            .error_rate(rate)
            .closed_len(window as usize)
            .half_open_len(self.recovery_calls.max(1) as usize)
            .open_wait(self.recovery_timeout)
            .build()
    }
}

/// Breaker guarding one archive store.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    successes: AtomicU64,
    outages: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            inner: config.recloser().into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            outages: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs one store call through the breaker.
    ///
    /// Outages count against the breaker, other errors are returned as-is.
    /// An open breaker answers `Unavailable("circuit open")` without calling `f`.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let guarded = async {
            match f().await {
                Err(e) if !e.is_unavailable() => Ok(Err(e)),
                other => other.map(Ok),
            }
        };

        match self.inner.call(guarded).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                result
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Store circuit open, call rejected");
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                Err(StorageError::Unavailable("circuit open".into()))
            }
            Err(RecloserError::Inner(e)) => {
                self.outages.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, error = %e, "Store outage");
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Calls that reached the store and were not outages.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn outages(&self) -> u64 {
        self.outages.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// One breaker per archive store.
pub struct StoreCircuits {
    pub primary: CircuitBreaker,
    pub secondary: CircuitBreaker,
}

impl Default for StoreCircuits {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCircuits {
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            primary: CircuitBreaker::new("primary_store", config.clone()),
            secondary: CircuitBreaker::new("secondary_store", config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitConfig {
                outage_threshold: threshold,
                recovery_calls: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        )
    }

    async fn outage(cb: &CircuitBreaker) -> Result<(), StorageError> {
        cb.call(|| async { Err(StorageError::Unavailable("connection refused".into())) }).await
    }

    async fn ok(cb: &CircuitBreaker) -> Result<(), StorageError> {
        cb.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_passes_values_through() {
        let cb = breaker(3);
        let value = cb.call(|| async { Ok::<_, StorageError>(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.outages(), 0);
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_outages() {
        let cb = breaker(3);
        for _ in 0..3 {
            assert!(matches!(outage(&cb).await, Err(StorageError::Unavailable(_))));
        }
        assert_eq!(cb.outages(), 3);

        let ran = std::sync::atomic::AtomicBool::new(false);
        let err = cb
            .call(|| async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), StorageError::Unavailable("circuit open".into()).to_string());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test]
    async fn test_success_breaks_an_outage_streak() {
        let cb = breaker(3);
        for _ in 0..4 {
            outage(&cb).await.unwrap_err();
            outage(&cb).await.unwrap_err();
            ok(&cb).await.unwrap();
        }
        assert_eq!(cb.outages(), 8);
        assert_eq!(cb.rejections(), 0);
    }

    #[tokio::test]
    async fn test_rejected_records_never_trip() {
        let cb = breaker(2);
        for id in 0..10 {
            let err = cb
                .call(|| async {
                    Err::<(), _>(StorageError::InvalidRecord { event_id: id, reason: "too long".into() })
                })
                .await
                .unwrap_err();
            assert!(err.is_invalid_record());
        }
        assert_eq!(cb.outages(), 0);
        assert_eq!(cb.rejections(), 0);
        ok(&cb).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovers_after_timeout() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        outage(&cb).await.unwrap_err();
        outage(&cb).await.unwrap_err();
        assert!(ok(&cb).await.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        ok(&cb).await.unwrap();
        ok(&cb).await.unwrap();
        assert_eq!(cb.rejections(), 1);
    }

    #[test]
    fn test_store_circuits_names() {
        let circuits = StoreCircuits::new();
        assert_eq!(circuits.primary.name(), "primary_store");
        assert_eq!(circuits.secondary.name(), "secondary_store");
    }
}
