//! Process-local cache counters.
//!
//! Every increment is mirrored to the `metrics` recorder so the same numbers
//! show up in `/api/cache/stats` and in whatever exporter is installed.

use std::sync::atomic::{AtomicU64, Ordering};

use devpulse_api_types::StatsReport;
use metrics::counter;

pub(crate) const METRIC_CACHE_HIT: &str = "devpulse_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "devpulse_cache_miss_total";
pub(crate) const METRIC_CACHE_INVALIDATED: &str = "devpulse_cache_invalidated_total";
pub(crate) const METRIC_CACHE_STORE_ERROR: &str = "devpulse_cache_store_error_total";

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidated: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_HIT).increment(1);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_MISS).increment(1);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidated(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.invalidated.fetch_add(count, Ordering::Relaxed);
        counter!(METRIC_CACHE_INVALIDATED).increment(count);
    }

    pub(crate) fn record_error(&self, op: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_STORE_ERROR, "op" => op).increment(1);
    }

    /// Hits divided by lookups; `0.0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let lookups = hits + self.misses.load(Ordering::Relaxed);
        if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        }
    }

    pub fn snapshot(&self) -> StatsReport {
        StatsReport {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}
