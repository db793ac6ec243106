//! In-memory store for tests/dev.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::time::Duration;

use chrono::{DateTime, Utc};

use kvcoord_core::{Clock, SystemClock};

use crate::store::{Store, StoreError, StoreResult};
use crate::subscription::Subscription;

#[derive(Debug)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_empty_collection(&self) -> bool {
        match &self.value {
            Value::Str(_) => false,
            Value::ZSet(z) => z.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
        }
    }
}

type Data = HashMap<String, Entry>;

/// In-memory store with Redis semantics.
///
/// - One mutex: every command is atomic, as on a single Redis node
/// - Expiry is evaluated against the injected [`Clock`]
/// - Empty collections disappear, like Redis keys do
/// - Pub/sub is best-effort in-process fan-out
#[derive(Debug)]
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    data: Mutex<Data>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Remaining TTL of a key, if it has one (test helper).
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let data = self.lock_data().ok()?;
        let at = data.get(key)?.expires_at?;
        (at - now).to_std().ok()
    }

    /// Whether a key is live (test helper).
    pub fn exists(&self, key: &str) -> bool {
        self.with_data(|data, _| Ok(data.contains_key(key)))
            .unwrap_or(false)
    }

    fn lock_data(&self) -> StoreResult<MutexGuard<'_, Data>> {
        self.data
            .lock()
            .map_err(|_| StoreError::Connection("in-memory store lock poisoned".to_string()))
    }

    /// Run a command against the live (non-expired) data set.
    fn with_data<R>(&self, f: impl FnOnce(&mut Data, DateTime<Utc>) -> StoreResult<R>) -> StoreResult<R> {
        let now = self.clock.now();
        let mut data = self.lock_data()?;
        data.retain(|_, e| e.expires_at.is_none_or(|at| at > now));
        let result = f(&mut data, now);
        data.retain(|_, e| !e.is_empty_collection());
        result
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(ttl.as_millis() as i64)
}

fn zset<'a>(data: &'a Data, key: &str) -> StoreResult<Option<&'a HashMap<String, f64>>> {
    match data.get(key) {
        None => Ok(None),
        Some(Entry {
            value: Value::ZSet(z),
            ..
        }) => Ok(Some(z)),
        Some(_) => Err(StoreError::wrong_type(key)),
    }
}

fn zset_mut<'a>(data: &'a mut Data, key: &str) -> StoreResult<&'a mut HashMap<String, f64>> {
    let entry = data
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::ZSet(HashMap::new())));
    match &mut entry.value {
        Value::ZSet(z) => Ok(z),
        _ => Err(StoreError::wrong_type(key)),
    }
}

fn set<'a>(data: &'a Data, key: &str) -> StoreResult<Option<&'a HashSet<String>>> {
    match data.get(key) {
        None => Ok(None),
        Some(Entry {
            value: Value::Set(s),
            ..
        }) => Ok(Some(s)),
        Some(_) => Err(StoreError::wrong_type(key)),
    }
}

fn set_mut<'a>(data: &'a mut Data, key: &str) -> StoreResult<&'a mut HashSet<String>> {
    let entry = data
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
    match &mut entry.value {
        Value::Set(s) => Ok(s),
        _ => Err(StoreError::wrong_type(key)),
    }
}

fn list_mut<'a>(data: &'a mut Data, key: &str) -> StoreResult<&'a mut VecDeque<String>> {
    let entry = data
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
    match &mut entry.value {
        Value::List(l) => Ok(l),
        _ => Err(StoreError::wrong_type(key)),
    }
}

/// Members sorted the way Redis orders a sorted set.
fn sorted(z: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = z.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

/// Resolve Redis-style inclusive (possibly negative) indices.
fn index_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl Store for InMemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_data(|data, _| match data.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::wrong_type(key)),
        })
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_data(|data, _| {
            data.insert(key.to_string(), Entry::new(Value::Str(value.to_string())));
            Ok(())
        })
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.with_data(|data, now| {
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(expiry(now, ttl)),
                },
            );
            Ok(())
        })
    }

    fn del(&self, key: &str) -> StoreResult<bool> {
        self.with_data(|data, _| Ok(data.remove(key).is_some()))
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.with_data(|data, now| {
            let current = match data.get(key) {
                None => None,
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Some(s.as_str()),
                Some(_) => return Err(StoreError::wrong_type(key)),
            };
            if current != expected {
                return Ok(false);
            }
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: ttl.map(|ttl| expiry(now, ttl)),
                },
            );
            Ok(true)
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_data(|data, now| match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(expiry(now, ttl));
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        self.with_data(|data, _| {
            let z = zset_mut(data, key)?;
            Ok(z.insert(member.to_string(), score).is_none())
        })
    }

    fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_data(|data, _| {
            if zset(data, key)?.is_none() {
                return Ok(false);
            }
            Ok(zset_mut(data, key)?.remove(member).is_some())
        })
    }

    fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.with_data(|data, _| {
            if zset(data, key)?.is_none() {
                return Ok(0);
            }
            let z = zset_mut(data, key)?;
            let before = z.len();
            z.retain(|_, score| *score < min || *score > max);
            Ok((before - z.len()) as u64)
        })
    }

    fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.with_data(|data, _| {
            let Some(z) = zset(data, key)? else {
                return Ok(vec![]);
            };
            let members = sorted(z);
            Ok(match index_range(members.len(), start, stop) {
                Some((from, to)) => members[from..=to].to_vec(),
                None => vec![],
            })
        })
    }

    fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.with_data(|data, _| {
            let Some(z) = zset(data, key)? else {
                return Ok(vec![]);
            };
            let mut members = sorted(z);
            members.reverse();
            Ok(match index_range(members.len(), start, stop) {
                Some((from, to)) => members[from..=to].iter().map(|(m, _)| m.clone()).collect(),
                None => vec![],
            })
        })
    }

    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<String>> {
        self.with_data(|data, _| {
            let Some(z) = zset(data, key)? else {
                return Ok(vec![]);
            };
            Ok(sorted(z)
                .into_iter()
                .filter(|(_, score)| *score >= min && *score <= max)
                .take(limit.unwrap_or(usize::MAX))
                .map(|(m, _)| m)
                .collect())
        })
    }

    fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.with_data(|data, _| Ok(zset(data, key)?.map_or(0, |z| z.len() as u64)))
    }

    fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.with_data(|data, _| Ok(zset(data, key)?.and_then(|z| z.get(member).copied())))
    }

    fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_data(|data, _| Ok(set_mut(data, key)?.insert(member.to_string())))
    }

    fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_data(|data, _| {
            if set(data, key)?.is_none() {
                return Ok(false);
            }
            Ok(set_mut(data, key)?.remove(member))
        })
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_data(|data, _| {
            let mut members: Vec<String> = set(data, key)?
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            members.sort();
            Ok(members)
        })
    }

    fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.with_data(|data, _| {
            let list = list_mut(data, key)?;
            list.push_back(value.to_string());
            Ok(list.len() as u64)
        })
    }

    fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_data(|data, _| {
            if !data.contains_key(key) {
                return Ok(None);
            }
            Ok(list_mut(data, key)?.pop_front())
        })
    }

    fn llen(&self, key: &str) -> StoreResult<u64> {
        self.with_data(|data, _| match data.get(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(l.len() as u64),
            Some(_) => Err(StoreError::wrong_type(key)),
        })
    }

    fn publish(&self, channel: &str, message: &str) -> StoreResult<u64> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| StoreError::Connection("in-memory pub/sub lock poisoned".to_string()))?;

        let Some(listeners) = subs.get_mut(channel) else {
            return Ok(0);
        };

        // Drop any dead subscribers while publishing.
        listeners.retain(|tx| tx.send(message.to_string()).is_ok());
        Ok(listeners.len() as u64)
    }

    fn subscribe(&self, channel: &str) -> StoreResult<Subscription<String>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .map_err(|_| StoreError::Connection("in-memory pub/sub lock poisoned".to_string()))?
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}
