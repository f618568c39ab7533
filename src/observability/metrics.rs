//! Ledger metrics.
//!
//! Lock-free atomic counters updated on the hot path; read them through
//! [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Thread-safe atomic counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Simple histogram using fixed buckets.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn default_latency() -> Self {
        Self::new(vec![1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum in the observed unit (ms); stored internally scaled by 1000.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

pub struct LedgerMetrics {
    pub tracks: Counter,
    pub tracks_rejected: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub resets_applied: Counter,
    pub reset_races_lost: Counter,
    pub anchor_fallbacks: Counter,
    pub syncs: Counter,
    pub sync_conflicts: Counter,
    pub sync_failures: Counter,
    pub topups_fired: Counter,
    pub topups_rejected: Counter,
    /// Charged top-ups whose purchase could not be applied.
    pub topups_failed: Counter,
    pub track_latency_ms: Histogram,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self {
            tracks: Counter::new(),
            tracks_rejected: Counter::new(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            resets_applied: Counter::new(),
            reset_races_lost: Counter::new(),
            anchor_fallbacks: Counter::new(),
            syncs: Counter::new(),
            sync_conflicts: Counter::new(),
            sync_failures: Counter::new(),
            topups_fired: Counter::new(),
            topups_rejected: Counter::new(),
            topups_failed: Counter::new(),
            track_latency_ms: Histogram::default_latency(),
        }
    }

    pub fn record_track(&self, accepted: bool, latency_ms: f64) {
        self.tracks.inc();
        if !accepted {
            self.tracks_rejected.inc();
        }
        self.track_latency_ms.observe(latency_ms);
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::from_metrics(self)
    }
}

impl Default for LedgerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of [`LedgerMetrics`] for export and assertions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tracks: u64,
    pub tracks_rejected: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub resets_applied: u64,
    pub reset_races_lost: u64,
    pub anchor_fallbacks: u64,
    pub syncs: u64,
    pub sync_conflicts: u64,
    pub sync_failures: u64,
    pub topups_fired: u64,
    pub topups_rejected: u64,
    pub topups_failed: u64,
    pub avg_track_latency_ms: f64,
}

impl MetricsSnapshot {
    pub fn from_metrics(metrics: &LedgerMetrics) -> Self {
        let count = metrics.track_latency_ms.count();
        let avg_track_latency_ms = if count > 0 {
            metrics.track_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        Self {
            tracks: metrics.tracks.get(),
            tracks_rejected: metrics.tracks_rejected.get(),
            cache_hits: metrics.cache_hits.get(),
            cache_misses: metrics.cache_misses.get(),
            resets_applied: metrics.resets_applied.get(),
            reset_races_lost: metrics.reset_races_lost.get(),
            anchor_fallbacks: metrics.anchor_fallbacks.get(),
            syncs: metrics.syncs.get(),
            sync_conflicts: metrics.sync_conflicts.get(),
            sync_failures: metrics.sync_failures.get(),
            topups_fired: metrics.topups_fired.get(),
            topups_rejected: metrics.topups_rejected.get(),
            topups_failed: metrics.topups_failed.get(),
            avg_track_latency_ms,
        }
    }
}
