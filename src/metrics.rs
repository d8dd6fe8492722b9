//! Ambient ingestion/flush counters, adapted from `cognitod/src/metrics.rs`'s
//! atomics-based `Metrics`: counters of unresolved accesses must be
//! reported at flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

/// Crate version string, computed once and shared by every `Metrics`
/// instance, mirroring `cognitod/src/api/mod.rs`'s `AYA_VERSION` pattern.
static ENGINE_VERSION: Lazy<String> = Lazy::new(|| env!("CARGO_PKG_VERSION").to_string());

/// Process-wide counters. Updated from the hot ingestion path, so every
/// field is a lock-free atomic.
pub struct Metrics {
    unresolved_accesses: AtomicU64,
    buffers_processed: AtomicU64,
    buffers_rejected: AtomicU64,
    flushes_completed: AtomicU64,
    flush_failures: AtomicU64,
    start_time: SystemTime,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            unresolved_accesses: AtomicU64::new(0),
            buffers_processed: AtomicU64::new(0),
            buffers_rejected: AtomicU64::new(0),
            flushes_completed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }

    /// A record whose `AccessKind` or owning memory object could not be
    /// resolved; the dispatcher skips it silently but must still count it.
    pub fn record_unresolved_access(&self) {
        self.unresolved_accesses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unresolved_accesses(&self) -> u64 {
        self.unresolved_accesses.load(Ordering::Relaxed)
    }

    pub fn record_buffer_processed(&self) {
        self.buffers_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_rejected(&self) {
        self.buffers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffers_processed(&self) -> u64 {
        self.buffers_processed.load(Ordering::Relaxed)
    }

    pub fn buffers_rejected(&self) -> u64 {
        self.buffers_rejected.load(Ordering::Relaxed)
    }

    /// A flush attempt failed I/O; analyzers keep their state so a later
    /// flush may still succeed.
    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_completed(&self) {
        self.flushes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    pub fn flushes_completed(&self) -> u64 {
        self.flushes_completed.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.start_time)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    /// The `redshow` crate version, for inclusion in flush-summary logs.
    pub fn engine_version(&self) -> &'static str {
        ENGINE_VERSION.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let m = Metrics::new();
        assert_eq!(m.unresolved_accesses(), 0);
        m.record_unresolved_access();
        m.record_unresolved_access();
        assert_eq!(m.unresolved_accesses(), 2);
    }

    #[test]
    fn engine_version_is_non_empty_and_stable_across_instances() {
        let a = Metrics::new();
        let b = Metrics::new();
        assert!(!a.engine_version().is_empty());
        assert_eq!(a.engine_version(), b.engine_version());
    }

    #[test]
    fn flush_failure_and_success_are_tracked_independently() {
        let m = Metrics::new();
        m.record_flush_failure();
        m.record_flush_completed();
        m.record_flush_completed();
        assert_eq!(m.flush_failures(), 1);
        assert_eq!(m.flushes_completed(), 2);
    }
}
