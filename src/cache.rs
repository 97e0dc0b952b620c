//! Time-bounded memoization for slow-changing reads.
//!
//! A [`TtlCache`] memoizes one read operation keyed by its arguments. Entries
//! expire after the configured time-to-live, or live until explicitly
//! invalidated when no TTL is given (static reference data).
//!
//! All caches of one store share a [`CacheControl`] switch. Any endpoint
//! invalidation turns storing off, since results may now be stale or
//! incomplete. The registry turns it back on at the next refresh that
//! leaves no endpoint in recovery, unless another suspension happened while
//! that refresh ran. While off, caches neither answer from nor write to
//! their entries.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::StoreMetrics;

/// Store-wide switch enabling or suspending result caching.
#[derive(Debug)]
pub struct CacheControl {
    /// Read on every cache access.
    enabled: AtomicBool,
    /// Bumped by every suspension. Writers of `enabled` hold this lock.
    epoch: Mutex<u64>,
}

impl CacheControl {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            epoch: Mutex::new(0),
        }
    }

    pub fn suspend(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch = epoch.wrapping_add(1);
        if self.enabled.swap(false, Ordering::AcqRel) {
            debug!("result caching suspended");
        }
    }

    /// Number of suspensions so far; pass to [`resume_since`](Self::resume_since).
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resume(&self) {
        let _epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.enabled.swap(true, Ordering::AcqRel) {
            debug!("result caching resumed");
        }
    }

    /// Resume unless anything suspended caching after `epoch` was read.
    /// Returns whether caching is now enabled.
    pub fn resume_since(&self, epoch: u64) -> bool {
        let current = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != epoch {
            debug!(since = epoch, now = *current, "suspended again meanwhile, caching stays off");
            return self.enabled.load(Ordering::Acquire);
        }
        if !self.enabled.swap(true, Ordering::AcqRel) {
            debug!("result caching resumed");
        }
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Default for CacheControl {
    fn default() -> Self {
        Self::new()
    }
}

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Memoized results of one read operation.
pub struct TtlCache<K, V> {
    name: &'static str,
    /// None = keep until invalidated.
    ttl: Option<Duration>,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    control: Arc<CacheControl>,
    metrics: Arc<StoreMetrics>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(
        name: &'static str,
        ttl: Option<Duration>,
        control: Arc<CacheControl>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            name,
            ttl,
            entries: Mutex::new(HashMap::new()),
            control,
            metrics,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry<V>) -> bool {
        self.ttl.map_or(true, |ttl| entry.stored_at.elapsed() < ttl)
    }

    /// Cached value for `key` if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        if !self.control.is_enabled() {
            return None;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if self.is_fresh(entry) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value unless caching is suspended.
    pub fn insert(&self, key: K, value: V) {
        if !self.control.is_enabled() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// The entry lock is not held while `compute` runs; two callers racing
    /// on a cold key may both compute.
    pub fn get_or_try_insert_with<F>(&self, key: K, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(&key) {
            self.metrics.record_cache_hit();
            return Ok(value);
        }
        self.metrics.record_cache_miss();

        let value = compute()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Like [`get_or_try_insert_with`](Self::get_or_try_insert_with), but an
    /// unreachable shard yields `fallback` instead of an error.
    ///
    /// Fallback values are never stored, so live results return as soon as
    /// the shard is reachable again.
    pub fn get_or_fallback<F>(&self, key: K, fallback: V, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        match self.get_or_try_insert_with(key, compute) {
            Err(e) if e.is_unavailable() => {
                warn!(cache = self.name, error = %e, "serving fallback value");
                self.metrics.record_cache_fallback();
                self.control.suspend();
                Ok(fallback)
            }
            other => other,
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
