//! Generic keyed pool of idle resources.
//!
//! Entries are parked LIFO per key, bounded by a per-key capacity, and
//! destroyed lazily once they out-sit the idle TTL. A resource is never
//! shared: it is either idle in the pool or checked out by exactly one
//! caller, and destroying it is simply dropping it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle entries kept per key; returning into a full bucket destroys the
    /// resource instead.
    pub per_key_capacity: usize,

    /// How long an entry may sit idle before it is destroyed on the next
    /// checkout attempt.
    pub idle_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            per_key_capacity: 5,
            idle_ttl: Duration::from_secs(60),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Checkouts satisfied from an idle entry.
    pub hits: u64,
    /// Checkouts that found no usable idle entry.
    pub misses: u64,
    /// Entries destroyed by TTL, capacity, or disposal.
    pub evicted: u64,
}

struct Idle<R> {
    resource: R,
    parked_at: Instant,
}

/// Keyed cache of idle resources.
pub struct ConnectionPool<K, R> {
    buckets: Mutex<HashMap<K, Vec<Idle<R>>>>,
    config: PoolConfig,
    disposed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
}

impl<K: Eq + Hash, R> ConnectionPool<K, R> {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
            disposed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Check out an idle resource for `key`, destroying any expired entries
    /// found on the way.
    pub fn take(&self, key: &K) -> Option<R> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let mut buckets = self.lock();
        if let Some(bucket) = buckets.get_mut(key) {
            while let Some(idle) = bucket.pop() {
                if idle.parked_at.elapsed() <= self.config.idle_ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(idle.resource);
                }
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Park a resource for reuse. Destroys it instead when the pool is
    /// disposed or the bucket is full.
    pub fn put(&self, key: K, resource: R) {
        if self.disposed.load(Ordering::Acquire) {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut buckets = self.lock();
        let bucket = buckets.entry(key).or_default();
        if bucket.len() >= self.config.per_key_capacity {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        bucket.push(Idle {
            resource,
            parked_at: Instant::now(),
        });
    }

    /// Destroy every idle entry and refuse further traffic.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let mut buckets = self.lock();
        for (_, bucket) in buckets.drain() {
            self.evicted
                .fetch_add(bucket.len() as u64, Ordering::Relaxed);
        }
    }

    /// Idle entries currently parked for `key`.
    pub fn idle_len(&self, key: &K) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Vec<Idle<R>>>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
