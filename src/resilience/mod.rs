//! Resilience primitives: retry with backoff, per-store circuit breakers
//! and the reconciliation queue for partial dual writes.

pub mod circuit_breaker;
pub mod reconcile;
pub mod retry;
