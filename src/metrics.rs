//! Lightweight counters for the store's resilience paths.
//!
//! Tracks what the health manager, fan-out engine and result caches do
//! under load: how often endpoints are invalidated and rebuilt, how many
//! fan-out reads came back partial, how often caches answered or fell back.
//!
//! # Design Decisions
//!
//! - **Thread-safe**: all counters are `AtomicU64`, incremented with
//!   `Relaxed` ordering. Counters are independent; no cross-counter
//!   consistency is promised by `snapshot()`.
//! - **Bounded memory**: fan-out latencies live in a fixed rolling window.
//!
//! # Example
//!
//! ```
//! use sharddb::metrics::StoreMetrics;
//!
//! let metrics = StoreMetrics::new();
//! metrics.record_fanout(3, 3, 12);
//! assert_eq!(metrics.snapshot().fanout_queries, 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Number of recent fan-out latencies kept for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Thread-safe counters shared (via `Arc`) by every component of one store.
pub struct StoreMetrics {
    // Fan-out
    fanout_queries: AtomicU64,
    single_shard_queries: AtomicU64,
    partial_fanouts: AtomicU64,
    fanout_latencies_ms: Mutex<VecDeque<u64>>,

    // Endpoint health
    soft_invalidations: AtomicU64,
    hard_invalidations: AtomicU64,
    connections_established: AtomicU64,
    connect_failures: AtomicU64,
    recheck_successes: AtomicU64,
    recheck_failures: AtomicU64,

    // Caches
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_fallbacks: AtomicU64,

    started_at: Instant,
}

/// Point-in-time copy of [`StoreMetrics`]. Plain values, no atomics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Multi-shard reads dispatched to parallel workers
    pub fanout_queries: u64,
    /// Reads served on the caller's thread because one shard was involved
    pub single_shard_queries: u64,
    /// Multi-shard reads where at least one shard missed the deadline or failed
    pub partial_fanouts: u64,
    pub fanout_p50_ms: u64,
    pub fanout_p95_ms: u64,
    pub fanout_p99_ms: u64,

    pub soft_invalidations: u64,
    pub hard_invalidations: u64,
    pub connections_established: u64,
    pub connect_failures: u64,
    pub recheck_successes: u64,
    pub recheck_failures: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Cached reads answered with their fallback because a shard was unreachable
    pub cache_fallbacks: u64,

    pub uptime_secs: u64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            fanout_queries: AtomicU64::new(0),
            single_shard_queries: AtomicU64::new(0),
            partial_fanouts: AtomicU64::new(0),
            fanout_latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            soft_invalidations: AtomicU64::new(0),
            hard_invalidations: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            recheck_successes: AtomicU64::new(0),
            recheck_failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_fallbacks: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a completed multi-shard read.
    ///
    /// `answered < shards` counts the read as partial.
    pub fn record_fanout(&self, shards: usize, answered: usize, duration_ms: u64) {
        self.fanout_queries.fetch_add(1, Ordering::Relaxed);
        if answered < shards {
            self.partial_fanouts.fetch_add(1, Ordering::Relaxed);
        }

        let mut latencies = self
            .fanout_latencies_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if latencies.len() >= LATENCY_WINDOW_SIZE {
            latencies.pop_front();
        }
        latencies.push_back(duration_ms);
    }

    pub fn record_single_shard(&self) {
        self.single_shard_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self, hard: bool) {
        let counter = if hard {
            &self.hard_invalidations
        } else {
            &self.soft_invalidations
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self, ok: bool) {
        let counter = if ok {
            &self.connections_established
        } else {
            &self.connect_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recheck(&self, ok: bool) {
        let counter = if ok {
            &self.recheck_successes
        } else {
            &self.recheck_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_fallback(&self) {
        self.cache_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99) = {
            let latencies = self
                .fanout_latencies_ms
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if latencies.is_empty() {
                (0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                (p50, p95, p99)
            }
        };

        MetricsSnapshot {
            fanout_queries: self.fanout_queries.load(Ordering::Relaxed),
            single_shard_queries: self.single_shard_queries.load(Ordering::Relaxed),
            partial_fanouts: self.partial_fanouts.load(Ordering::Relaxed),
            fanout_p50_ms: p50,
            fanout_p95_ms: p95,
            fanout_p99_ms: p99,
            soft_invalidations: self.soft_invalidations.load(Ordering::Relaxed),
            hard_invalidations: self.hard_invalidations.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            recheck_successes: self.recheck_successes.load(Ordering::Relaxed),
            recheck_failures: self.recheck_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_fallbacks: self.cache_fallbacks.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}
