//! Cache counters and the pull-based snapshot handed to the observability layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counters updated by the cache on every operation.
///
/// All counters use relaxed atomics: they are independent tallies, not a
/// synchronization mechanism.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    upstream_errors: AtomicU64,
    rejected_inserts: AtomicU64,
    timeouts: AtomicU64,
    fetches: AtomicU64,
    fetch_micros: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bypass(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_insert(&self) {
        self.rejected_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one completed upstream fetch and how long it took.
    pub(crate) fn record_fetch(&self, elapsed: Duration) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.fetch_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Captures the counters together with gauges read from the store and coalescer.
    pub fn snapshot(&self, gauges: Gauges) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let fetches = self.fetches.load(Ordering::Relaxed);
        let fetch_micros = self.fetch_micros.load(Ordering::Relaxed);

        let lookups = hits + misses;
        let hit_ratio = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        let mean_fetch_micros = fetch_micros.checked_div(fetches).unwrap_or(0);

        MetricsSnapshot {
            hits,
            misses,
            bypasses: self.bypasses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            rejected_inserts: self.rejected_inserts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            in_flight: gauges.in_flight,
            entry_count: gauges.entry_count,
            estimated_bytes: gauges.estimated_bytes,
            hit_ratio,
            mean_fetch_micros,
        }
    }
}

/// Point-in-time gauges supplied by the components that own the state.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gauges {
    pub in_flight: usize,
    pub entry_count: usize,
    pub estimated_bytes: u64,
}

/// A read-only view of the cache's counters and gauges.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Requests served without the cache (unsupported parameters, disabled endpoint).
    pub bypasses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub upstream_errors: u64,
    /// Results that could not be stored because they exceeded capacity.
    pub rejected_inserts: u64,
    pub timeouts: u64,
    pub in_flight: usize,
    pub entry_count: usize,
    pub estimated_bytes: u64,
    pub hit_ratio: f64,
    pub mean_fetch_micros: u64,
}
