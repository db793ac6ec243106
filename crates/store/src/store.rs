//! Store abstraction.

use std::sync::Arc;
use std::time::Duration;

use kvcoord_core::CoordError;

use crate::subscription::Subscription;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    #[error("wrong value type at key {0}")]
    WrongType(String),
}

impl StoreError {
    pub fn wrong_type(key: &str) -> Self {
        Self::WrongType(key.to_string())
    }
}

impl From<StoreError> for CoordError {
    fn from(value: StoreError) -> Self {
        CoordError::StoreUnavailable(value.to_string())
    }
}

/// Shared key-value store: atomic single-key commands only.
///
/// No command spans more than one key and no multi-key transaction is
/// available. Components compose these commands and must stay correct when
/// other processes interleave their own commands between any two calls.
///
/// Sorted-set scores are `f64`; every caller in this workspace stores Unix
/// milliseconds in them. Range indices follow Redis semantics: inclusive,
/// negative values count from the end.
pub trait Store: Send + Sync {
    // -- strings --

    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value without expiry (clears any previous TTL).
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Set a value that expires after `ttl`.
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete a key of any type. Returns whether it existed.
    fn del(&self, key: &str) -> StoreResult<bool>;

    /// Atomically replace a string value if it still equals `expected`
    /// (`None` = the key must not exist). Returns whether the write happened.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// (Re)arm the key's TTL. Returns false if the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    // -- sorted sets --

    /// Add or re-score a member. Returns whether it was newly added.
    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;

    /// Remove one member. Returns whether it was present.
    ///
    /// Exactly one of several concurrent callers observes `true`, which makes
    /// this the claim primitive for moving ids between structures.
    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove members with `min <= score <= max`. Returns how many.
    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    /// Members by ascending score (ties by member), with scores.
    fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Members by descending score.
    fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    /// Members with `min <= score <= max`, ascending, at most `limit` of them.
    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>>;

    fn zcard(&self, key: &str) -> StoreResult<u64>;

    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    // -- sets --

    fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    // -- lists --

    /// Append to the tail. Returns the new length.
    fn rpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Pop from the head.
    fn lpop(&self, key: &str) -> StoreResult<Option<String>>;

    fn llen(&self, key: &str) -> StoreResult<u64>;

    // -- pub/sub --

    /// Publish to a channel. Returns how many live subscribers received it.
    fn publish(&self, channel: &str, message: &str) -> StoreResult<u64>;

    fn subscribe(&self, channel: &str) -> StoreResult<Subscription<String>>;
}

impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        (**self).set(key, value)
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        (**self).set_ex(key, value, ttl)
    }

    fn del(&self, key: &str) -> StoreResult<bool> {
        (**self).del(key)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        (**self).compare_and_set(key, expected, value, ttl)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        (**self).expire(key, ttl)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        (**self).zadd(key, member, score)
    }

    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        (**self).zrem(key, member)
    }

    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        (**self).zrem_range_by_score(key, min, max)
    }

    fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        (**self).zrange_with_scores(key, start, stop)
    }

    fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        (**self).zrevrange(key, start, stop)
    }

    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        (**self).zrange_by_score(key, min, max, limit)
    }

    fn zcard(&self, key: &str) -> StoreResult<u64> {
        (**self).zcard(key)
    }

    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        (**self).zscore(key, member)
    }

    fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        (**self).sadd(key, member)
    }

    fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        (**self).srem(key, member)
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        (**self).smembers(key)
    }

    fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        (**self).rpush(key, value)
    }

    fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).lpop(key)
    }

    fn llen(&self, key: &str) -> StoreResult<u64> {
        (**self).llen(key)
    }

    fn publish(&self, channel: &str, message: &str) -> StoreResult<u64> {
        (**self).publish(channel, message)
    }

    fn subscribe(&self, channel: &str) -> StoreResult<Subscription<String>> {
        (**self).subscribe(channel)
    }
}
