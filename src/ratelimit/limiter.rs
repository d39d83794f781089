//! Core rate limiter implementation.
//!
//! A check first tries to consume from the key's local reservation. When that
//! is absent, expired or down to its last unit, the limiter goes to the shared
//! store: it reads the counter, rejects if it already exceeds the rate, and
//! otherwise leases a whole bucket with one atomic increment.
//!
//! The comparison uses the counter as read *before* incrementing, so a key can
//! overshoot `rate` by up to `bucket_size - 1` calls (more across several
//! instances) before a rejection is observed.

use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use super::cache::LocalAdmissionCache;
use super::policy::FailurePolicy;
use super::rules::{RateLimitConfig, ValidatedLimit};
use crate::error::{RateLimitError, Result};
use crate::store::CounterStore;

/// How an admitted call was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Served from the local reservation without contacting the store
    FastPath,
    /// Checked against the store; `counter` is the post-increment value
    Authoritative { counter: u64 },
    /// The store failed and the fail-open policy admitted the call
    FailedOpen,
}

/// The rate limiter shared by every caller in the process.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    cache: LocalAdmissionCache,
    policy: FailurePolicy,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("cache", &self.cache)
            .field("policy", &self.policy)
            .finish()
    }
}

impl RateLimiter {
    /// Create a fail-open rate limiter backed by `store`.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_policy(store, FailurePolicy::default())
    }

    /// Create a rate limiter with an explicit store failure policy.
    pub fn with_policy(store: Arc<dyn CounterStore>, policy: FailurePolicy) -> Self {
        Self {
            store,
            cache: LocalAdmissionCache::new(),
            policy,
        }
    }

    /// Decide whether a call for `config.key` may proceed.
    ///
    /// Returns `Ok` when admitted. Fails with `Config` for invalid parameters,
    /// `RateExceeded` when the store shows the key over budget, and
    /// `StoreUnavailable` only under the fail-closed policy.
    pub async fn check_limit(&self, config: &RateLimitConfig) -> Result<Admission> {
        let limit = config.validate()?;

        if self.cache.try_consume(limit.key) {
            trace!(key = %limit.key, "Admitted from local reservation");
            return Ok(Admission::FastPath);
        }

        // Register the new reservation before the round-trip so concurrent
        // callers for this key keep taking the fast path meanwhile.
        self.cache
            .install(limit.key, limit.bucket_size.get(), limit.window);

        match self.acquire_lease(&limit).await {
            Ok(counter) => Ok(Admission::Authoritative { counter }),
            Err(RateLimitError::StoreUnavailable(e)) => {
                if self.policy.admits_on_store_failure() {
                    warn!(key = %limit.key, error = %e, "Store check failed, admitting call");
                    Ok(Admission::FailedOpen)
                } else {
                    self.cache.invalidate(limit.key);
                    warn!(key = %limit.key, error = %e, "Store check failed, rejecting call");
                    Err(RateLimitError::StoreUnavailable(e))
                }
            }
            Err(e) => {
                self.cache.invalidate(limit.key);
                Err(e)
            }
        }
    }

    /// Authoritative step: read the shared counter and, unless it already
    /// exceeds the rate, lease one bucket of quota from it.
    ///
    /// Returns the counter value after the increment. Does not touch the
    /// local cache.
    #[instrument(
        skip(self, limit),
        fields(
            key = %limit.key,
            bucket_size = limit.bucket_size.get(),
            rate = limit.rate.get()
        )
    )]
    pub async fn acquire_lease(&self, limit: &ValidatedLimit<'_>) -> Result<u64> {
        let current = self.store.get(limit.key).await?;
        debug!(current = ?current, "Current rate");

        if let Some(current) = current {
            if current > limit.rate.get() {
                debug!(current, "Rate limit exceeded");
                return Err(RateLimitError::RateExceeded {
                    key: limit.key.to_string(),
                });
            }
        }

        let counter = self
            .store
            .increment_with_expiry(limit.key, limit.bucket_size.get(), limit.window)
            .await?;
        debug!(counter, "Leased bucket from store");
        Ok(counter)
    }

    /// Forget everything known about `key`: drop the local reservation and
    /// delete the shared counter.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key);
        self.store.delete(key).await?;
        debug!(key = %key, "Reset rate limit state");
        Ok(())
    }

    /// The local admission cache.
    pub fn cache(&self) -> &LocalAdmissionCache {
        &self.cache
    }

    /// The store failure policy.
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, StoreConfig};
    use crate::store::{InMemoryCounterStore, RedisCounterStore};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn svc_a() -> RateLimitConfig {
        RateLimitConfig::new("svcA", 5, 10, 1)
    }

    fn limiter_with_store() -> (RateLimiter, Arc<InMemoryCounterStore>) {
        let store = Arc::new(InMemoryCounterStore::new());
        (RateLimiter::new(store.clone()), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_bucket_served_locally_after_first_call() {
        let (limiter, store) = limiter_with_store();
        let config = svc_a();

        let first = assert_ok!(limiter.check_limit(&config).await);
        assert_eq!(first, Admission::Authoritative { counter: 5 });

        for _ in 0..4 {
            assert_eq!(
                assert_ok!(limiter.check_limit(&config).await),
                Admission::FastPath
            );
        }

        let stats = store.stats();
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.increments, 1);
        assert_eq!(store.ttl("svcA"), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_store_counter_advances_by_bucket_until_rejected() {
        let (limiter, store) = limiter_with_store();
        let config = svc_a();

        let mut authoritative = Vec::new();
        for _ in 0..15 {
            if let Admission::Authoritative { counter } =
                assert_ok!(limiter.check_limit(&config).await)
            {
                authoritative.push(counter);
            }
        }
        // The counter equal to the rate is not over it, so 10 still leases.
        assert_eq!(authoritative, vec![5, 10, 15]);

        let err = assert_err!(limiter.check_limit(&config).await);
        match err {
            RateLimitError::RateExceeded { key } => assert_eq!(key, "svcA"),
            other => panic!("expected RateExceeded, got {:?}", other),
        }
        assert_eq!(
            RateLimitError::RateExceeded { key: "svcA".into() }.to_string(),
            "too many requests per second for svcA"
        );
        assert_eq!(store.stats().increments, 3);
    }

    #[tokio::test]
    async fn test_comparison_is_strict() {
        let (limiter, store) = limiter_with_store();

        store.set("svcA", 10);
        assert_eq!(
            assert_ok!(limiter.check_limit(&svc_a()).await),
            Admission::Authoritative { counter: 15 }
        );

        let (limiter, store) = limiter_with_store();
        store.set("svcA", 11);
        let err = assert_err!(limiter.check_limit(&svc_a()).await);
        assert!(err.is_rate_exceeded());
    }

    #[tokio::test]
    async fn test_rejection_invalidates_reservation() {
        let (limiter, store) = limiter_with_store();
        store.set("svcA", 11);

        assert_err!(limiter.check_limit(&svc_a()).await);
        assert_eq!(limiter.cache().remaining("svcA"), None);

        // The next call goes back to the store instead of a stale reservation.
        assert_err!(limiter.check_limit(&svc_a()).await);
        assert_eq!(store.stats().gets, 2);
        assert_eq!(store.stats().increments, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_regardless_of_store() {
        let (limiter, store) = limiter_with_store();
        let missing_key = RateLimitConfig::new("", 5, 10, 1);

        let err = assert_err!(limiter.check_limit(&missing_key).await);
        assert!(matches!(err, RateLimitError::Config(_)));

        store.set("", 1_000);
        let err = assert_err!(limiter.check_limit(&missing_key).await);
        assert!(matches!(err, RateLimitError::Config(_)));

        store.set_available(false);
        let err = assert_err!(limiter.check_limit(&missing_key).await);
        assert!(matches!(err, RateLimitError::Config(_)));

        let zero_rate = RateLimitConfig::new("svcA", 5, 0, 1);
        let err = assert_err!(limiter.check_limit(&zero_rate).await);
        assert!(matches!(err, RateLimitError::Config(_)));

        assert_eq!(store.stats().round_trips(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_time_slice() {
        let (limiter, store) = limiter_with_store();
        let config = svc_a();

        for _ in 0..15 {
            assert_ok!(limiter.check_limit(&config).await);
        }
        assert_err!(limiter.check_limit(&config).await);

        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(
            assert_ok!(limiter.check_limit(&config).await),
            Admission::Authoritative { counter: 5 }
        );
        assert_eq!(store.ttl("svcA"), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_reservation_forces_store_check() {
        let (limiter, store) = limiter_with_store();
        let config = RateLimitConfig::new("svcA", 50, 1_000, 2);

        assert_ok!(limiter.check_limit(&config).await);
        assert_eq!(
            assert_ok!(limiter.check_limit(&config).await),
            Admission::FastPath
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            assert_ok!(limiter.check_limit(&config).await),
            Admission::Authoritative { counter: 50 }
        );
        assert_eq!(store.stats().increments, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_time_slice_is_admitted() {
        let (limiter, store) = limiter_with_store();
        let config = RateLimitConfig::new("svcA", 5, 10, u64::MAX);

        assert_eq!(
            assert_ok!(limiter.check_limit(&config).await),
            Admission::Authoritative { counter: 5 }
        );
        assert_eq!(
            assert_ok!(limiter.check_limit(&config).await),
            Admission::FastPath
        );
        assert_eq!(store.ttl("svcA"), Some(crate::ratelimit::MAX_WINDOW));
    }

    #[tokio::test]
    async fn test_fail_open_admits_when_store_down() {
        let (limiter, store) = limiter_with_store();
        store.set_available(false);

        assert_eq!(
            assert_ok!(limiter.check_limit(&svc_a()).await),
            Admission::FailedOpen
        );
        // The optimistic reservation stays in place.
        assert_eq!(
            assert_ok!(limiter.check_limit(&svc_a()).await),
            Admission::FastPath
        );
    }

    #[tokio::test]
    async fn test_fail_open_does_not_swallow_rejection() {
        let (limiter, store) = limiter_with_store();
        assert_eq!(limiter.policy(), FailurePolicy::Open);
        store.set("svcA", 100);

        let err = assert_err!(limiter.check_limit(&svc_a()).await);
        assert!(err.is_rate_exceeded());
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_when_store_down() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = RateLimiter::with_policy(store.clone(), FailurePolicy::Closed);
        store.set_available(false);

        let err = assert_err!(limiter.check_limit(&svc_a()).await);
        assert!(matches!(err, RateLimitError::StoreUnavailable(_)));
        assert_eq!(limiter.cache().remaining("svcA"), None);

        store.set_available(true);
        assert_eq!(
            assert_ok!(limiter.check_limit(&svc_a()).await),
            Admission::Authoritative { counter: 5 }
        );
    }

    #[tokio::test]
    async fn test_fail_open_with_unreachable_redis() {
        let config = StoreConfig {
            request_timeout_ms: 200,
            pool: PoolConfig {
                max_wait_ms: 200,
                ..PoolConfig::default()
            },
            ..StoreConfig::new("127.0.0.1", 1)
        };
        let store = Arc::new(RedisCounterStore::new(&config).unwrap());
        let limiter = RateLimiter::new(store);

        assert_eq!(
            assert_ok!(limiter.check_limit(&svc_a()).await),
            Admission::FailedOpen
        );
    }

    #[tokio::test]
    async fn test_acquire_lease_leaves_cache_alone() {
        let (limiter, store) = limiter_with_store();
        let config = svc_a();
        let limit = config.validate().unwrap();

        assert_eq!(assert_ok!(limiter.acquire_lease(&limit).await), 5);
        assert_eq!(assert_ok!(limiter.acquire_lease(&limit).await), 10);
        assert!(limiter.cache().is_empty());

        store.set("svcA", 11);
        let err = assert_err!(limiter.acquire_lease(&limit).await);
        assert!(err.is_rate_exceeded());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, store) = limiter_with_store();
        store.set("svcA", 11);

        assert_err!(limiter.check_limit(&svc_a()).await);
        assert_ok!(
            limiter
                .check_limit(&RateLimitConfig::new("svcB", 5, 10, 1))
                .await
        );
    }

    #[tokio::test]
    async fn test_reset_clears_store_and_cache() {
        let (limiter, store) = limiter_with_store();

        assert_ok!(limiter.check_limit(&svc_a()).await);
        assert!(limiter.cache().remaining("svcA").is_some());

        assert_ok!(limiter.reset("svcA").await);
        assert_eq!(limiter.cache().remaining("svcA"), None);
        assert_eq!(assert_ok!(store.get("svcA").await), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_share_reservation() {
        let (limiter, store) = limiter_with_store();
        let limiter = Arc::new(limiter);
        let config = RateLimitConfig::new("hot", 10, 100_000, 60);

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                let config = config.clone();
                tokio::spawn(async move { limiter.check_limit(&config).await })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        assert!(results.into_iter().all(|r| r.unwrap().is_ok()));

        let stats = store.stats();
        assert_eq!(stats.gets, stats.increments);
        assert!(stats.increments < 200);
    }
}
