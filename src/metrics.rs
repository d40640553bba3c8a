// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for archive-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `archive_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: primary, secondary, memory, or a backend's configured name
//! - `resource`: rate limiter key (source, primary, secondary)
//! - `outcome`: success, partial, failure, rejected, cancelled

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// SOURCE - Page fetches and retries
// ═══════════════════════════════════════════════════════════════════════════

/// Record one fetched page and how many events it carried
pub fn record_page_fetched(direction: &str, events: usize) {
    counter!(
        "archive_sync_pages_fetched_total",
        "direction" => direction.to_string()
    )
    .increment(1);
    histogram!("archive_sync_page_events").record(events as f64);
}

/// Record a retried source call
pub fn record_fetch_retry(reason: &str) {
    counter!(
        "archive_sync_fetch_retries_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record raw events dropped during normalization or validation
pub fn record_records_rejected(stage: &str, count: usize) {
    counter!(
        "archive_sync_records_rejected_total",
        "stage" => stage.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// RATE LIMITING
// ═══════════════════════════════════════════════════════════════════════════

/// Record time a caller spent waiting for a token
pub fn record_rate_limit_wait(resource: &str, waited: Duration) {
    histogram!(
        "archive_sync_rate_limit_wait_seconds",
        "resource" => resource.to_string()
    )
    .record(waited.as_secs_f64());
}

/// Record a "slow down" signal from a resource
pub fn record_rate_limit_backoff(resource: &str) {
    counter!(
        "archive_sync_rate_limit_backoffs_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

/// Set the effective rate factor for a resource (1.0 = nominal)
pub fn set_rate_factor(resource: &str, factor: f64) {
    gauge!(
        "archive_sync_rate_factor",
        "resource" => resource.to_string()
    )
    .set(factor);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORES - Writes, latency, health
// ═══════════════════════════════════════════════════════════════════════════

/// Record records written to a store, by outcome
pub fn record_store_write(store: &str, outcome: &str, count: usize) {
    counter!(
        "archive_sync_store_writes_total",
        "store" => store.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(count as u64);
}

/// Record store operation latency
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "archive_sync_store_operation_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a store error by category
pub fn record_store_error(store: &str, operation: &str, error_type: &str) {
    counter!(
        "archive_sync_store_errors_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Set store health status (from ping)
pub fn set_store_healthy(store: &str, healthy: bool) {
    gauge!(
        "archive_sync_store_healthy",
        "store" => store.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "archive_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RECONCILIATION - Secondary repair queue
// ═══════════════════════════════════════════════════════════════════════════

/// Set reconciliation queue depth
pub fn set_reconcile_pending(count: u64) {
    gauge!("archive_sync_reconcile_pending").set(count as f64);
}

/// Record a reconciliation drain pass
pub fn record_reconcile_drain(repaired: usize, success: bool) {
    let status = if success { "success" } else { "partial" };
    counter!(
        "archive_sync_reconcile_drains_total",
        "status" => status
    )
    .increment(1);
    counter!("archive_sync_reconcile_repaired_total").increment(repaired as u64);
}

/// Record parity differences found between the stores
pub fn record_parity_mismatch(kind: &str, count: usize) {
    counter!(
        "archive_sync_parity_mismatches_total",
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULER - Gaps, units, runs
// ═══════════════════════════════════════════════════════════════════════════

/// Record gap detection results for one channel
pub fn record_gaps_found(mode: &str, gaps: usize, suspects: usize) {
    counter!("archive_sync_gaps_found_total", "mode" => mode.to_string()).increment(gaps as u64);
    counter!("archive_sync_suspects_found_total", "mode" => mode.to_string())
        .increment(suspects as u64);
}

/// Record a finished work unit
pub fn record_unit_outcome(outcome: &str, records: u64, duration: Duration) {
    counter!(
        "archive_sync_work_units_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    counter!("archive_sync_records_synced_total").increment(records);
    histogram!("archive_sync_work_unit_seconds").record(duration.as_secs_f64());
}

/// Set number of work units currently in flight
pub fn set_active_units(count: usize) {
    gauge!("archive_sync_active_units").set(count as f64);
}

/// Record a finished run
pub fn record_run(outcome: &str, duration: Duration) {
    counter!(
        "archive_sync_runs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("archive_sync_run_seconds").record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    store: String,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(store: impl Into<String>, operation: &'static str) -> Self {
        Self {
            store: store.into(),
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(&self.store, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed: these only check the calls don't panic.

    #[test]
    fn test_source_metrics() {
        record_page_fetched("descending", 100);
        record_fetch_retry("rate_limited");
        record_records_rejected("normalize", 2);
    }

    #[test]
    fn test_rate_limit_metrics() {
        record_rate_limit_wait("source", Duration::from_millis(250));
        record_rate_limit_backoff("source");
        set_rate_factor("source", 0.5);
    }

    #[test]
    fn test_store_metrics() {
        record_store_write("primary", "success", 100);
        record_store_write("secondary", "failure", 3);
        record_store_error("secondary", "upsert_batch", "unavailable");
        set_store_healthy("primary", true);
        record_circuit_breaker_call("secondary_store", "rejected");
    }

    #[test]
    fn test_reconcile_and_run_metrics() {
        set_reconcile_pending(12);
        record_reconcile_drain(10, true);
        record_parity_mismatch("missing", 4);
        record_gaps_found("thorough", 3, 1);
        set_active_units(2);
        record_unit_outcome("success", 500, Duration::from_secs(3));
        record_run("partial_success", Duration::from_secs(60));
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("primary", "upsert");
            std::thread::sleep(Duration::from_micros(10));
        }
    }
}
