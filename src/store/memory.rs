//! In-process counter store.
//!
//! Implements the same contract as the Redis client against a local map. It
//! shares nothing across processes, so it is only suitable for tests and
//! single-instance deployments. Expired keys are swept every
//! [`SWEEP_INTERVAL`] increments so abandoned windows do not accumulate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{CounterStore, StoreError};

/// Increments between sweeps of expired keys.
pub const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// A counter store backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, Entry>,
    unavailable: AtomicBool,
    ops: AtomicU64,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage. While unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Current value of `key`, or `None` if it is absent or expired.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.count)
    }

    /// Remaining time-to-live of `key`, or `None` if it has no expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of stored keys, including ones that have expired but not yet
    /// been touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            trace!(removed = removed, "Purged expired in-memory counters");
        }
        removed
    }

    /// Remove every key.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;

        // Sweep before taking the entry guard; retain locks every shard.
        if (self.ops.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            self.purge_expired();
        }

        let now = Instant::now();
        // The entry guard holds the shard lock, so read-modify-write is atomic.
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                count: 0,
                expires_at: None,
            };
        }
        entry.count += 1;

        trace!(key = %key, count = entry.count, "Incremented in-memory counter");
        Ok(entry.count)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.check_available()?;

        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
