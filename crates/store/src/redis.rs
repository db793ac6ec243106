//! Redis-backed store (feature `redis`).
//!
//! Every call opens its own connection from the client, so a `RedisStore`
//! can be shared freely across threads. Pub/sub runs on a dedicated
//! background connection per subscription.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use redis::{ErrorKind, RedisError};

use crate::store::{Store, StoreError, StoreResult};
use crate::subscription::Subscription;

/// Compare-and-set on a string key.
///
/// ARGV: `[must_be_absent ("1"/"0"), expected, new_value, ttl_ms (0 = none)]`.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current then return 0 end
else
  if current ~= ARGV[2] then return 0 end
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// Redis store.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: redis::Client,
    compare_and_set: redis::Script,
}

impl RedisStore {
    pub fn open(redis_url: impl AsRef<str>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_err)?;
        Ok(Self {
            client,
            compare_and_set: redis::Script::new(COMPARE_AND_SET),
        })
    }

    /// Round-trip a PING (startup health check).
    pub fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn()?;
        redis::cmd("PING").query::<String>(&mut conn).map_err(map_err)?;
        Ok(())
    }

    fn conn(&self) -> StoreResult<redis::Connection> {
        self.client.get_connection().map_err(map_err)
    }

    fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> StoreResult<T> {
        let mut conn = self.conn()?;
        cmd.query(&mut conn).map_err(map_err)
    }
}

fn map_err(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        return StoreError::Connection(e.to_string());
    }
    if e.code() == Some("WRONGTYPE") {
        return StoreError::WrongType(e.to_string());
    }
    match e.kind() {
        ErrorKind::IoError => StoreError::Connection(e.to_string()),
        _ => StoreError::Command(e.to_string()),
    }
}

/// Score bound in the form ZRANGEBYSCORE accepts.
fn bound(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX rejects 0.
    (ttl.as_millis() as u64).max(1)
}

impl Store for RedisStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.query(redis::cmd("SET").arg(key).arg(value))
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.query(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl)),
        )
    }

    fn del(&self, key: &str) -> StoreResult<bool> {
        let removed: i64 = self.query(redis::cmd("DEL").arg(key))?;
        Ok(removed > 0)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let written: i64 = self
            .compare_and_set
            .key(key)
            .arg(if expected.is_none() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl.map(millis).unwrap_or(0))
            .invoke(&mut conn)
            .map_err(map_err)?;
        Ok(written == 1)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let armed: i64 = self.query(redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))?;
        Ok(armed == 1)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let added: i64 = self.query(redis::cmd("ZADD").arg(key).arg(score).arg(member))?;
        Ok(added == 1)
    }

    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: i64 = self.query(redis::cmd("ZREM").arg(key).arg(member))?;
        Ok(removed == 1)
    }

    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.query(
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(bound(min))
                .arg(bound(max)),
        )
    }

    fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.query(
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .arg("WITHSCORES"),
        )
    }

    fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("ZREVRANGE").arg(key).arg(start).arg(stop))
    }

    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(bound(min)).arg(bound(max));
        if let Some(count) = limit {
            cmd.arg("LIMIT").arg(0).arg(count);
        }
        self.query(&cmd)
    }

    fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("ZCARD").arg(key))
    }

    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.query(redis::cmd("ZSCORE").arg(key).arg(member))
    }

    fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let added: i64 = self.query(redis::cmd("SADD").arg(key).arg(member))?;
        Ok(added == 1)
    }

    fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: i64 = self.query(redis::cmd("SREM").arg(key).arg(member))?;
        Ok(removed == 1)
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut members: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(key))?;
        members.sort();
        Ok(members)
    }

    fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value))
    }

    fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("LPOP").arg(key))
    }

    fn llen(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("LLEN").arg(key))
    }

    fn publish(&self, channel: &str, message: &str) -> StoreResult<u64> {
        self.query(redis::cmd("PUBLISH").arg(channel).arg(message))
    }

    fn subscribe(&self, channel: &str) -> StoreResult<Subscription<String>> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<StoreResult<()>>();

        let client = self.client.clone();
        let channel = channel.to_string();

        // Background thread that receives pub/sub messages and forwards them.
        thread::Builder::new()
            .name(format!("kvcoord-sub-{channel}"))
            .spawn(move || {
                let mut conn = match client.get_connection() {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ready_tx.send(Err(map_err(e)));
                        return;
                    }
                };

                let mut pubsub = conn.as_pubsub();
                if let Err(e) = pubsub.subscribe(&channel) {
                    let _ = ready_tx.send(Err(map_err(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                loop {
                    let msg = match pubsub.get_message() {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::debug!(channel = %channel, error = %e, "subscription closed");
                            return;
                        }
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    if tx.send(payload).is_err() {
                        return;
                    }
                }
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        // Only hand the subscription back once the server has acknowledged it,
        // so a publish issued right after `subscribe` returns is not missed.
        ready_rx
            .recv()
            .map_err(|_| StoreError::Connection("subscriber thread exited".to_string()))??;

        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bounds_render_infinities() {
        assert_eq!(bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(bound(f64::INFINITY), "+inf");
        assert_eq!(bound(1_700_000_000_000.0), "1700000000000");
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
    }

    #[test]
    fn open_rejects_malformed_url() {
        assert!(RedisStore::open("not a url").is_err());
    }
}
