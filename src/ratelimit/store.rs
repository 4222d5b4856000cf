//! Storage abstraction for limiter state.
//!
//! The limiter keeps one theoretical-arrival-time (nanoseconds since the
//! epoch) per identity. Stores treat the value as opaque. Backends only need per-key atomic
//! insert-if-absent and update-if-present; those two preconditions are the
//! limiter's compare-and-swap.

use async_trait::async_trait;
use chrono::Duration;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use crate::error::Result;

/// Trait for rate limit state backends.
///
/// Implementations must make `add` and `update` atomic per key. Transport
/// failures are reported as errors, never as a failed precondition.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Fetch the timestamp stored for `key`, if a live entry exists.
    async fn try_get(&self, key: &str) -> Result<Option<i64>>;

    /// Insert `timestamp` under `key` only if no live entry exists.
    ///
    /// Returns `true` if the entry was written.
    async fn add(&self, key: &str, timestamp: i64, ttl: Duration) -> Result<bool>;

    /// Overwrite the entry under `key` only if a live entry exists.
    ///
    /// Returns `true` if the entry was written.
    async fn update(&self, key: &str, timestamp: i64, ttl: Duration) -> Result<bool>;
}

/// Inserts between full sweeps of expired [`MemoryStore`] entries.
pub const PURGE_INTERVAL: u64 = 1024;

/// Clamp non-positive expirations to one second.
pub fn normalize_ttl(ttl: Duration) -> Duration {
    if ttl <= Duration::zero() {
        Duration::seconds(1)
    } else {
        ttl
    }
}

/// A stored timestamp and the instant it stops being visible.
#[derive(Debug, Clone, Copy)]
struct Slot {
    timestamp: i64,
    expires_at_nanos: i64,
}

impl Slot {
    fn new(timestamp: i64, ttl: Duration, now_nanos: i64) -> Self {
        let ttl_nanos = normalize_ttl(ttl).num_nanoseconds().unwrap_or(i64::MAX);
        Self {
            timestamp,
            expires_at_nanos: now_nanos.saturating_add(ttl_nanos),
        }
    }

    fn is_live(&self, now_nanos: i64) -> bool {
        self.expires_at_nanos > now_nanos
    }
}

/// In-process store backed by a concurrent hash map.
///
/// Expired entries are evicted when read, and every [`PURGE_INTERVAL`]
/// inserts the whole map is swept so identities that never return do not
/// accumulate.
#[derive(Debug)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    inserts: AtomicU64,
}

impl MemoryStore {
    /// Create a store that expires entries by wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires entries according to `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            inserts: AtomicU64::new(0),
        }
    }

    /// Drop all expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_nanos();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    fn note_insert(&self) {
        let inserts = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts % PURGE_INTERVAL == 0 {
            let purged = self.purge_expired();
            debug!(purged, remaining = self.slots.len(), "Swept expired entries");
        }
    }

    /// Number of entries held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn try_get(&self, key: &str) -> Result<Option<i64>> {
        let now = self.clock.now_nanos();
        // Copy out so the shard lock is released before any removal.
        let slot = self.slots.get(key).map(|slot| *slot);

        match slot {
            Some(slot) if slot.is_live(now) => Ok(Some(slot.timestamp)),
            Some(_) => {
                self.slots.remove_if(key, |_, slot| !slot.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn add(&self, key: &str, timestamp: i64, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_nanos();
        let slot = Slot::new(timestamp, ttl, now);

        let written = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    false
                } else {
                    entry.insert(slot);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(slot);
                true
            }
        };

        trace!(key = %key, timestamp, written, "Store add");
        if written {
            self.note_insert();
        }
        Ok(written)
    }

    async fn update(&self, key: &str, timestamp: i64, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_nanos();

        let written = match self.slots.get_mut(key) {
            Some(mut slot) if slot.is_live(now) => {
                *slot = Slot::new(timestamp, ttl, now);
                true
            }
            _ => false,
        };

        trace!(key = %key, timestamp, written, "Store update");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_normalize_ttl() {
        assert_eq!(normalize_ttl(Duration::zero()), Duration::seconds(1));
        assert_eq!(normalize_ttl(Duration::milliseconds(-40)), Duration::seconds(1));
        assert_eq!(normalize_ttl(Duration::milliseconds(40)), Duration::milliseconds(40));
    }

    #[tokio::test]
    async fn test_try_get_missing() {
        let (store, _) = store_with_clock();
        assert_eq!(store.try_get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_only_when_absent() {
        let (store, _) = store_with_clock();

        assert!(store.add("k", 10, Duration::seconds(5)).await.unwrap());
        assert!(!store.add("k", 20, Duration::seconds(5)).await.unwrap());
        assert_eq!(store.try_get("k").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_update_only_when_present() {
        let (store, _) = store_with_clock();

        assert!(!store.update("k", 10, Duration::seconds(5)).await.unwrap());
        assert_eq!(store.try_get("k").await.unwrap(), None);

        store.add("k", 10, Duration::seconds(5)).await.unwrap();
        assert!(store.update("k", 30, Duration::seconds(5)).await.unwrap());
        assert_eq!(store.try_get("k").await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (store, clock) = store_with_clock();

        store.add("k", 10, Duration::milliseconds(200)).await.unwrap();
        clock.advance(std::time::Duration::from_millis(199));
        assert_eq!(store.try_get("k").await.unwrap(), Some(10));

        clock.advance(std::time::Duration::from_millis(1));
        assert_eq!(store.try_get("k").await.unwrap(), None);
        assert!(!store.update("k", 11, Duration::seconds(1)).await.unwrap());
        assert!(store.add("k", 12, Duration::seconds(1)).await.unwrap());
        assert_eq!(store.try_get("k").await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_non_positive_ttl_lasts_one_second() {
        let (store, clock) = store_with_clock();

        store.add("k", 10, Duration::milliseconds(-5)).await.unwrap();
        clock.advance(std::time::Duration::from_millis(999));
        assert_eq!(store.try_get("k").await.unwrap(), Some(10));

        clock.advance(std::time::Duration::from_millis(1));
        assert_eq!(store.try_get("k").await.unwrap(), None);
    }

    #[test]
    fn test_usable_as_trait_object() {
        let (store, _) = store_with_clock();
        let store: Arc<dyn RateLimitStore> = Arc::new(store);

        tokio_test::block_on(async {
            assert!(store.add("k", 1, Duration::seconds(1)).await.unwrap());
            assert_eq!(store.try_get("k").await.unwrap(), Some(1));
        });
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();

        store.add("short", 1, Duration::milliseconds(100)).await.unwrap();
        store.add("long", 2, Duration::seconds(10)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(std::time::Duration::from_secs(1));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entry_evicted_on_read() {
        let (store, clock) = store_with_clock();

        store.add("k", 1, Duration::milliseconds(100)).await.unwrap();
        store.add("other", 2, Duration::seconds(10)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(std::time::Duration::from_millis(100));
        assert_eq!(store.try_get("k").await.unwrap(), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.try_get("other").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_inserts_sweep_abandoned_identities() {
        let (store, clock) = store_with_clock();

        for i in 0..PURGE_INTERVAL - 1 {
            let key = format!("client-{}", i);
            assert!(store.add(&key, 1, Duration::milliseconds(50)).await.unwrap());
        }
        assert_eq!(store.len(), (PURGE_INTERVAL - 1) as usize);

        // None of those identities come back; the next insert triggers a sweep.
        clock.advance(std::time::Duration::from_millis(50));
        assert!(store.add("fresh", 1, Duration::seconds(1)).await.unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.try_get("fresh").await.unwrap(), Some(1));
    }
}
