//! GCRA rate limiter.
//!
//! Implements the Generic Cell Rate Algorithm as a dual leaky bucket. Each
//! identity has a theoretical arrival time (TAT) in the store, kept in
//! nanoseconds since the epoch so sub-millisecond emission intervals are
//! charged exactly; a request is
//! admitted when its new TAT minus the burst tolerance is not in the future.
//! Concurrent callers are reconciled through the store's insert-if-absent /
//! update-if-present preconditions, retried up to a fixed budget.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::quota::RateQuota;
use super::result::RateLimitResult;
use super::store::RateLimitStore;
use crate::error::{Result, ThrottleError};

/// Maximum store write attempts per decision.
pub const MAX_CAS_ATTEMPTS: u32 = 10;

/// Per-quota GCRA parameters, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gcra {
    /// Burst limit, `max_burst + 1`
    limit: i64,
    /// Virtual time charged per unit of quantity
    emission_interval: i64,
    /// Delay-variation tolerance, `emission_interval * limit`
    tolerance: i64,
}

impl Gcra {
    fn new(quota: &RateQuota) -> Self {
        let period = i64::try_from(quota.period.duration().as_nanos()).unwrap_or(i64::MAX);
        let emission_interval = (period / quota.max_rate).max(1);
        let limit = quota.max_burst + 1;

        Self {
            limit,
            emission_interval,
            tolerance: emission_interval.saturating_mul(limit),
        }
    }

    /// Units of quantity still available given the time left on the bucket.
    fn remaining(&self, ttl: i64) -> i64 {
        let next = self.tolerance - ttl;
        if next > -self.emission_interval {
            next / self.emission_interval
        } else {
            0
        }
    }
}

/// The rate limiter.
///
/// Holds no per-identity state of its own; every decision is a
/// read-compute-conditional-write cycle against the store.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter using the system clock.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a new rate limiter with a custom time source.
    pub fn with_clock(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Check a single request against `quota` for `identity`.
    pub async fn check(&self, quota: RateQuota, identity: &str) -> Result<RateLimitResult> {
        self.rate_limit(quota, identity, 1).await
    }

    /// Check whether `quantity` units for `identity` fit within `quota`.
    ///
    /// Rejections leave the store untouched. Store errors are returned as-is;
    /// only lost conditional writes are retried.
    pub async fn rate_limit(
        &self,
        quota: RateQuota,
        identity: &str,
        quantity: u32,
    ) -> Result<RateLimitResult> {
        if quota.max_rate < 1 || quota.max_burst < 1 {
            return Err(ThrottleError::InvalidQuota {
                max_rate: quota.max_rate,
                max_burst: quota.max_burst,
            });
        }

        let gcra = Gcra::new(&quota);
        let increment = gcra.emission_interval.saturating_mul(i64::from(quantity));

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now_nanos();
            let stored = self.store.try_get(identity).await?;
            let tat = stored.unwrap_or(now);

            let new_tat = now.max(tat).saturating_add(increment);
            let allow_at = new_tat.saturating_sub(gcra.tolerance);

            trace!(
                identity = %identity,
                attempt,
                tat,
                new_tat,
                now,
                "Evaluating rate limit"
            );

            if now < allow_at {
                let retry_after = if increment <= gcra.tolerance {
                    Duration::nanoseconds(allow_at - now)
                } else {
                    RateLimitResult::no_retry()
                };
                let ttl = tat - now;

                debug!(
                    identity = %identity,
                    quota = %quota,
                    retry_after_ms = retry_after.num_milliseconds(),
                    "Rate limit exceeded"
                );

                return Ok(RateLimitResult {
                    limited: true,
                    max_limit: gcra.limit,
                    remaining: gcra.remaining(ttl),
                    reset_after: Duration::nanoseconds(ttl),
                    retry_after,
                });
            }

            let ttl = new_tat - now;
            let ttl_duration = Duration::nanoseconds(ttl);

            let written = if stored.is_some() {
                self.store.update(identity, new_tat, ttl_duration).await?
            } else {
                self.store.add(identity, new_tat, ttl_duration).await?
            };

            if written {
                return Ok(RateLimitResult {
                    limited: false,
                    max_limit: gcra.limit,
                    remaining: gcra.remaining(ttl),
                    reset_after: ttl_duration,
                    retry_after: RateLimitResult::no_retry(),
                });
            }

            debug!(
                identity = %identity,
                attempt,
                "Lost store race, retrying"
            );
        }

        warn!(
            identity = %identity,
            attempts = MAX_CAS_ATTEMPTS,
            "Rate limit store update did not converge"
        );

        Err(ThrottleError::ConcurrencyExhausted {
            identity: identity.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::quota::RateLimitPeriod;
    use crate::ratelimit::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const START_MS: i64 = 1_700_000_000_000;

    fn limiter_with_clock() -> (RateLimiter, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::with_clock(store.clone(), clock.clone());
        (limiter, store, clock)
    }

    /// Store whose conditional writes always lose the race.
    #[derive(Default)]
    struct ContendedStore {
        writes: AtomicU32,
    }

    #[async_trait]
    impl RateLimitStore for ContendedStore {
        async fn try_get(&self, _key: &str) -> Result<Option<i64>> {
            Ok(None)
        }

        async fn add(&self, _key: &str, _ts: i64, _ttl: Duration) -> Result<bool> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }

        async fn update(&self, _key: &str, _ts: i64, _ttl: Duration) -> Result<bool> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    /// Store that fails every read.
    #[derive(Default)]
    struct FailingStore {
        reads: AtomicU32,
    }

    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn try_get(&self, _key: &str) -> Result<Option<i64>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(ThrottleError::Store("connection refused".to_string()))
        }

        async fn add(&self, _key: &str, _ts: i64, _ttl: Duration) -> Result<bool> {
            Ok(true)
        }

        async fn update(&self, _key: &str, _ts: i64, _ttl: Duration) -> Result<bool> {
            Ok(true)
        }
    }

    /// Store that yields between operations and counts successful inserts.
    struct YieldingStore {
        inner: MemoryStore,
        adds: AtomicU32,
    }

    #[async_trait]
    impl RateLimitStore for YieldingStore {
        async fn try_get(&self, key: &str) -> Result<Option<i64>> {
            tokio::task::yield_now().await;
            self.inner.try_get(key).await
        }

        async fn add(&self, key: &str, ts: i64, ttl: Duration) -> Result<bool> {
            tokio::task::yield_now().await;
            let written = self.inner.add(key, ts, ttl).await?;
            if written {
                self.adds.fetch_add(1, Ordering::SeqCst);
            }
            Ok(written)
        }

        async fn update(&self, key: &str, ts: i64, ttl: Duration) -> Result<bool> {
            tokio::task::yield_now().await;
            self.inner.update(key, ts, ttl).await
        }
    }

    #[test]
    fn test_gcra_parameters() {
        let gcra = Gcra::new(&RateQuota::new(3, 3, RateLimitPeriod::Second));
        assert_eq!(gcra.limit, 4);
        assert_eq!(gcra.emission_interval, 333_333_333);
        assert_eq!(gcra.tolerance, 1_333_333_332);

        let gcra = Gcra::new(&RateQuota::new(1, 1, RateLimitPeriod::Week));
        assert_eq!(gcra.emission_interval, 604_800_000_000_000);

        // Rates finer than a nanosecond still charge something.
        let gcra = Gcra::new(&RateQuota::new(i64::MAX, 1, RateLimitPeriod::Second));
        assert_eq!(gcra.emission_interval, 1);
    }

    #[tokio::test]
    async fn test_burst_then_reject() {
        let (limiter, _, _) = limiter_with_clock();
        let quota = RateQuota::new(3, 3, RateLimitPeriod::Second);

        for i in 1..=4 {
            let result = limiter.check(quota, "x").await.unwrap();
            assert!(!result.is_limited(), "request {} should be allowed", i);
            assert_eq!(result.max_limit, 4);
            assert_eq!(result.retry_after_hint(), None);
        }

        let result = limiter.check(quota, "x").await.unwrap();
        assert!(result.is_limited());
        assert!(result.retry_after > Duration::zero());
        assert!(result.retry_after <= Duration::milliseconds(334));
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_burst_then_reject_system_clock() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let quota = RateQuota::new(3, 3, RateLimitPeriod::Second);

        for _ in 0..4 {
            assert!(!limiter.check(quota, "x").await.unwrap().is_limited());
        }
        let result = limiter.check(quota, "x").await.unwrap();
        assert!(result.is_limited());
        assert!(result.retry_after > Duration::zero());
    }

    #[tokio::test]
    async fn test_remaining_decreases() {
        let (limiter, _, _) = limiter_with_clock();
        let quota = RateQuota::new(10, 4, RateLimitPeriod::Minute);

        let remaining: Vec<i64> = {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(limiter.check(quota, "id").await.unwrap().remaining);
            }
            out
        };

        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);
        assert!(limiter.check(quota, "id").await.unwrap().is_limited());
    }

    #[tokio::test]
    async fn test_reset_after_tracks_bucket_level() {
        let (limiter, _, _) = limiter_with_clock();
        let quota = RateQuota::new(1, 2, RateLimitPeriod::Second);

        let first = limiter.check(quota, "id").await.unwrap();
        assert_eq!(first.reset_after, Duration::seconds(1));

        let second = limiter.check(quota, "id").await.unwrap();
        assert_eq!(second.reset_after, Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_recovers_after_emission_interval() {
        let (limiter, _, clock) = limiter_with_clock();
        let quota = RateQuota::new(2, 1, RateLimitPeriod::Second);

        assert!(!limiter.check(quota, "id").await.unwrap().is_limited());
        assert!(!limiter.check(quota, "id").await.unwrap().is_limited());
        let rejected = limiter.check(quota, "id").await.unwrap();
        assert!(rejected.is_limited());

        let wait = rejected.retry_after.to_std().unwrap();
        clock.advance(wait);
        assert!(!limiter.check(quota, "id").await.unwrap().is_limited());
        assert!(limiter.check(quota, "id").await.unwrap().is_limited());
    }

    #[tokio::test]
    async fn test_sub_millisecond_emission_interval() {
        let (limiter, store, clock) = limiter_with_clock();
        // Half a millisecond per request, burst of one.
        let quota = RateQuota::new(2000, 1, RateLimitPeriod::Second);

        let mut allowed = 0;
        for _ in 0..100 {
            if !limiter.check(quota, "fast").await.unwrap().is_limited() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 2);
        assert_eq!(
            store.try_get("fast").await.unwrap(),
            Some(START_MS * 1_000_000 + 1_000_000)
        );

        // One emission interval later exactly one more fits.
        clock.advance(std::time::Duration::from_micros(500));
        assert!(!limiter.check(quota, "fast").await.unwrap().is_limited());
        assert!(limiter.check(quota, "fast").await.unwrap().is_limited());
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let (limiter, _, _) = limiter_with_clock();
        let quota = RateQuota::new(1, 1, RateLimitPeriod::Hour);

        assert!(!limiter.check(quota, "a").await.unwrap().is_limited());
        assert!(!limiter.check(quota, "a").await.unwrap().is_limited());
        assert!(limiter.check(quota, "a").await.unwrap().is_limited());
        assert!(!limiter.check(quota, "b").await.unwrap().is_limited());
    }

    #[tokio::test]
    async fn test_rejection_does_not_write() {
        let (limiter, store, _) = limiter_with_clock();
        let quota = RateQuota::new(1, 1, RateLimitPeriod::Minute);

        limiter.check(quota, "id").await.unwrap();
        limiter.check(quota, "id").await.unwrap();
        let before = store.try_get("id").await.unwrap();

        assert!(limiter.check(quota, "id").await.unwrap().is_limited());
        assert_eq!(store.try_get("id").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_quantity_larger_than_burst() {
        let (limiter, store, _) = limiter_with_clock();
        let quota = RateQuota::new(5, 2, RateLimitPeriod::Second);

        let result = limiter.rate_limit(quota, "bulk", 10).await.unwrap();
        assert!(result.is_limited());
        assert_eq!(result.retry_after_hint(), None);
        assert_eq!(result.reset_after, Duration::zero());
        assert_eq!(store.try_get("bulk").await.unwrap(), None);

        let result = limiter.rate_limit(quota, "bulk", 3).await.unwrap();
        assert!(!result.is_limited());
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_invalid_quota() {
        let (limiter, _, _) = limiter_with_clock();

        for quota in [
            RateQuota::NONE,
            RateQuota::new(0, 5, RateLimitPeriod::Second),
            RateQuota::new(5, 0, RateLimitPeriod::Second),
            RateQuota::new(-1, 5, RateLimitPeriod::Second),
        ] {
            let err = limiter.check(quota, "id").await.unwrap_err();
            assert!(matches!(err, ThrottleError::InvalidQuota { .. }));
        }
    }

    #[tokio::test]
    async fn test_concurrency_exhausted() {
        let store = Arc::new(ContendedStore::default());
        let limiter = RateLimiter::new(store.clone());
        let quota = RateQuota::new(10, 10, RateLimitPeriod::Second);

        let err = limiter.check(quota, "hot").await.unwrap_err();
        match err {
            ThrottleError::ConcurrencyExhausted { identity, attempts } => {
                assert_eq!(identity, "hot");
                assert_eq!(attempts, MAX_CAS_ATTEMPTS);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.writes.load(Ordering::SeqCst), MAX_CAS_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_store_errors_are_not_retried() {
        let store = Arc::new(FailingStore::default());
        let limiter = RateLimiter::new(store.clone());
        let quota = RateQuota::new(10, 10, RateLimitPeriod::Second);

        let err = limiter.check(quota, "id").await.unwrap_err();
        assert!(matches!(err, ThrottleError::Store(_)));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_writers_converge() {
        let clock = Arc::new(ManualClock::at_millis(START_MS));
        let store = Arc::new(YieldingStore {
            inner: MemoryStore::with_clock(clock.clone()),
            adds: AtomicU32::new(0),
        });
        let limiter = Arc::new(RateLimiter::with_clock(store.clone(), clock.clone()));
        let quota = RateQuota::new(100, 100, RateLimitPeriod::Second);

        let calls = (0..16).map(|_| {
            let limiter = limiter.clone();
            async move { limiter.check(quota, "shared").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(results.len(), 16);
        for result in results {
            assert!(!result.unwrap().is_limited());
        }
        // Every racer read "absent", but only one insert may win.
        assert_eq!(store.adds.load(Ordering::SeqCst), 1);
        assert!(store.try_get("shared").await.unwrap().is_some());
    }
}
