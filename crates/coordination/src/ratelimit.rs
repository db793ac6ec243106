//! Sliding-window rate limiting.
//!
//! Each (endpoint, identifier) pair owns a sorted set of request timestamps.
//! A check records its own entry first and then counts: if the count including
//! that entry exceeds the limit, the entry is withdrawn and the request is
//! refused. Every admitted request therefore saw all earlier admissions in its
//! count, so no more than `limit` requests are admitted per window even when
//! many processes check the same key at once. Concurrent refused requests may
//! briefly occupy a slot and refuse a borderline neighbour; the limiter errs
//! on the side of refusing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use kvcoord_core::{Clock, CoordError, CoordResult, SystemClock, from_unix_millis, unix_millis};
use kvcoord_store::Store;

use crate::config::EndpointLimits;
use crate::keys::KeySpace;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub limited: bool,
    pub limit: u32,
    /// Requests still allowed in the current window.
    pub remaining: u32,
    /// When the oldest counted request leaves the window.
    pub reset: DateTime<Utc>,
    /// Zero unless `limited`.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// `retry_after` rounded up to whole seconds (the `Retry-After` header form).
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter<S: Store> {
    store: S,
    keys: KeySpace,
    limits: EndpointLimits,
    clock: Arc<dyn Clock>,
}

impl<S: Store> RateLimiter<S> {
    pub fn new(store: S, keys: KeySpace, limits: EndpointLimits) -> Self {
        Self {
            store,
            keys,
            limits,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn limits(&self) -> &EndpointLimits {
        &self.limits
    }

    /// Check and record one request using the configured rule for `endpoint`.
    pub fn check_endpoint(&self, endpoint: &str, identifier: &str) -> CoordResult<RateLimitDecision> {
        let rule = self.limits.rule(endpoint);
        self.check(endpoint, identifier, rule.limit, rule.window())
    }

    /// Check and record one request against an explicit limit/window.
    pub fn check(
        &self,
        endpoint: &str,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> CoordResult<RateLimitDecision> {
        validate(endpoint, identifier, limit, window)?;

        let key = self.keys.rate_limit(endpoint, identifier);
        let now = self.clock.now();
        let now_ms = unix_millis(now);
        let window_ms = window.as_millis() as i64;

        self.store
            .zrem_range_by_score(&key, f64::NEG_INFINITY, (now_ms - window_ms) as f64)?;

        let member = format!("{now_ms}-{}", Uuid::now_v7().simple());
        self.store.zadd(&key, &member, now_ms as f64)?;
        let count = self.store.zcard(&key)?;

        if count > u64::from(limit) {
            self.store.zrem(&key, &member)?;
            let reset = self.oldest(&key)?.unwrap_or(now_ms) + window_ms;
            let retry_after = Duration::from_millis((reset - now_ms).max(0) as u64);

            debug!(
                endpoint = %endpoint,
                identifier = %identifier,
                limit,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limited"
            );

            return Ok(RateLimitDecision {
                limited: true,
                limit,
                remaining: 0,
                reset: from_unix_millis(reset),
                retry_after,
            });
        }

        self.store.expire(&key, window * 2)?;
        let reset = self.oldest(&key)?.unwrap_or(now_ms) + window_ms;

        Ok(RateLimitDecision {
            limited: false,
            limit,
            remaining: limit - count as u32,
            reset: from_unix_millis(reset),
            retry_after: Duration::ZERO,
        })
    }

    /// Report what a check would decide right now, without recording anything.
    pub fn peek(
        &self,
        endpoint: &str,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> CoordResult<RateLimitDecision> {
        validate(endpoint, identifier, limit, window)?;

        let key = self.keys.rate_limit(endpoint, identifier);
        let now_ms = unix_millis(self.clock.now());
        let window_ms = window.as_millis() as i64;

        // Scores are whole milliseconds; +1 excludes the boundary like `check` does.
        let live = self.store.zrange_by_score(
            &key,
            (now_ms - window_ms + 1) as f64,
            f64::INFINITY,
            None,
        )?;
        let count = live.len() as u64;

        let oldest_live = match live.first() {
            Some(member) => self.store.zscore(&key, member)?.map(|s| s as i64),
            None => None,
        };
        let reset = oldest_live.unwrap_or(now_ms) + window_ms;
        let limited = count >= u64::from(limit);

        Ok(RateLimitDecision {
            limited,
            limit,
            remaining: u64::from(limit).saturating_sub(count) as u32,
            reset: from_unix_millis(reset),
            retry_after: if limited {
                Duration::from_millis((reset - now_ms).max(0) as u64)
            } else {
                Duration::ZERO
            },
        })
    }

    /// Forget every recorded request for the pair. Returns whether any existed.
    pub fn reset(&self, endpoint: &str, identifier: &str) -> CoordResult<bool> {
        if endpoint.is_empty() || identifier.is_empty() {
            return Err(CoordError::validation("endpoint and identifier must not be empty"));
        }
        Ok(self.store.del(&self.keys.rate_limit(endpoint, identifier))?)
    }

    fn oldest(&self, key: &str) -> CoordResult<Option<i64>> {
        Ok(self
            .store
            .zrange_with_scores(key, 0, 0)?
            .first()
            .map(|(_, score)| *score as i64))
    }
}

fn validate(endpoint: &str, identifier: &str, limit: u32, window: Duration) -> CoordResult<()> {
    if endpoint.is_empty() || identifier.is_empty() {
        return Err(CoordError::validation("endpoint and identifier must not be empty"));
    }
    if limit == 0 {
        return Err(CoordError::validation("rate limit must be at least 1"));
    }
    if window.as_millis() == 0 {
        return Err(CoordError::validation("rate limit window must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvcoord_core::ManualClock;
    use kvcoord_store::InMemoryStore;

    const MINUTE: Duration = Duration::from_secs(60);

    fn limiter() -> (Arc<ManualClock>, Arc<InMemoryStore>, RateLimiter<Arc<InMemoryStore>>) {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::new(store.clone(), KeySpace::new("t"), EndpointLimits::default())
            .with_clock(clock.clone());
        (clock, store, limiter)
    }

    #[test]
    fn counts_down_then_limits_then_recovers() {
        let (clock, _store, limiter) = limiter();

        let remaining: Vec<u32> = (0..5)
            .map(|_| limiter.check("login", "10.0.0.1", 5, MINUTE).unwrap())
            .inspect(|d| assert!(!d.limited))
            .map(|d| d.remaining)
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let sixth = limiter.check("login", "10.0.0.1", 5, MINUTE).unwrap();
        assert!(sixth.limited);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.retry_after, MINUTE);
        assert_eq!(sixth.retry_after_secs(), 60);

        clock.advance(Duration::from_secs(61));
        let later = limiter.check("login", "10.0.0.1", 5, MINUTE).unwrap();
        assert!(!later.limited);
        assert_eq!(later.remaining, 4);
    }

    #[test]
    fn refused_requests_do_not_consume_the_window() {
        let (clock, store, limiter) = limiter();

        limiter.check("upload", "u1", 1, MINUTE).unwrap();
        for _ in 0..10 {
            assert!(limiter.check("upload", "u1", 1, MINUTE).unwrap().limited);
        }
        assert_eq!(store.zcard(&KeySpace::new("t").rate_limit("upload", "u1")).unwrap(), 1);

        clock.advance(Duration::from_secs(30));
        let refused = limiter.check("upload", "u1", 1, MINUTE).unwrap();
        assert_eq!(refused.retry_after, Duration::from_secs(30));
    }

    #[test]
    fn identifiers_and_endpoints_are_independent() {
        let (_clock, _store, limiter) = limiter();

        assert!(!limiter.check("login", "a", 1, MINUTE).unwrap().limited);
        assert!(!limiter.check("login", "b", 1, MINUTE).unwrap().limited);
        assert!(!limiter.check("register", "a", 1, MINUTE).unwrap().limited);
        assert!(limiter.check("login", "a", 1, MINUTE).unwrap().limited);
    }

    #[test]
    fn admitted_check_sets_twice_window_ttl() {
        let (_clock, store, limiter) = limiter();
        limiter.check("login", "ip", 5, MINUTE).unwrap();
        assert_eq!(
            store.ttl(&KeySpace::new("t").rate_limit("login", "ip")),
            Some(MINUTE * 2)
        );
    }

    #[test]
    fn check_endpoint_uses_configured_rule() {
        let (_clock, _store, limiter) = limiter();

        for _ in 0..3 {
            assert!(!limiter.check_endpoint("register", "ip").unwrap().limited);
        }
        let refused = limiter.check_endpoint("register", "ip").unwrap();
        assert!(refused.limited);
        assert_eq!(refused.limit, 3);
        assert_eq!(refused.retry_after, Duration::from_secs(3_600));

        assert_eq!(limiter.check_endpoint("anything", "ip").unwrap().limit, 100);
    }

    #[test]
    fn peek_does_not_record() {
        let (_clock, _store, limiter) = limiter();

        limiter.check("login", "ip", 2, MINUTE).unwrap();
        let peeked = limiter.peek("login", "ip", 2, MINUTE).unwrap();
        assert!(!peeked.limited);
        assert_eq!(peeked.remaining, 1);

        limiter.check("login", "ip", 2, MINUTE).unwrap();
        let peeked = limiter.peek("login", "ip", 2, MINUTE).unwrap();
        assert!(peeked.limited);
        assert_eq!(peeked.retry_after, MINUTE);
        assert_eq!(limiter.peek("login", "ip", 2, MINUTE).unwrap(), peeked);
    }

    #[test]
    fn reset_clears_the_window() {
        let (_clock, _store, limiter) = limiter();

        limiter.check("login", "ip", 1, MINUTE).unwrap();
        assert!(limiter.check("login", "ip", 1, MINUTE).unwrap().limited);
        assert!(limiter.reset("login", "ip").unwrap());
        assert!(!limiter.check("login", "ip", 1, MINUTE).unwrap().limited);
        assert!(!limiter.reset("login", "other").unwrap());
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let (_clock, _store, limiter) = limiter();
        assert!(matches!(
            limiter.check("", "ip", 1, MINUTE),
            Err(CoordError::Validation(_))
        ));
        assert!(matches!(
            limiter.check("login", "ip", 0, MINUTE),
            Err(CoordError::Validation(_))
        ));
        assert!(matches!(
            limiter.check("login", "ip", 1, Duration::ZERO),
            Err(CoordError::Validation(_))
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 200,
                ..ProptestConfig::default()
            })]

            /// Property: a check is admitted exactly when fewer than `limit`
            /// admissions fall inside the trailing window.
            #[test]
            fn admits_exactly_the_sliding_window_budget(
                limit in 1u32..8,
                window_secs in 1u64..20,
                gaps_ms in proptest::collection::vec(0u64..3_000, 1..80)
            ) {
                let (clock, _store, limiter) = limiter();
                let window = Duration::from_secs(window_secs);
                let window_ms = (window_secs * 1_000) as i64;
                let mut admitted: Vec<i64> = Vec::new();

                for gap in gaps_ms {
                    clock.advance(Duration::from_millis(gap));
                    let now = unix_millis(clock.now());
                    let in_window = admitted.iter().filter(|t| **t > now - window_ms).count() as u32;

                    let decision = limiter.check("p", "id", limit, window).unwrap();
                    prop_assert_eq!(decision.limited, in_window >= limit);

                    if !decision.limited {
                        prop_assert_eq!(decision.remaining, limit - in_window - 1);
                        admitted.push(now);
                    } else {
                        prop_assert!(decision.retry_after > Duration::ZERO);
                    }
                }
            }
        }
    }
}
