//! JSON records and optimistic updates.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use kvcoord_core::{CoordError, CoordResult, Versioned};
use kvcoord_store::Store;

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> CoordResult<String> {
    serde_json::to_string(value).map_err(|e| CoordError::corrupted(key, e))
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> CoordResult<T> {
    serde_json::from_str(raw).map_err(|e| CoordError::corrupted(key, e))
}

/// Read and decode a plain JSON record.
pub(crate) fn load<S, T>(store: &S, key: &str) -> CoordResult<Option<T>>
where
    S: Store + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(raw) => decode(key, &raw).map(Some),
        None => Ok(None),
    }
}

/// Read a versioned record, keeping the raw bytes for a later compare-and-set.
pub(crate) fn load_versioned<S, T>(store: &S, key: &str) -> CoordResult<Option<(String, Versioned<T>)>>
where
    S: Store + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(raw) => {
            let record = decode(key, &raw)?;
            Ok(Some((raw, record)))
        }
        None => Ok(None),
    }
}

/// Result of [`cas_update`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CasOutcome<T> {
    /// The record does not exist (never created, expired or deleted).
    Absent,
    /// The update function declined to change the record.
    Unchanged(T),
    Updated(T),
}

/// Optimistically replace a versioned record.
///
/// `update` sees the current value and returns the replacement, or `None` to
/// leave the record alone; `ttl` picks the expiry of the replacement. The
/// write only lands if the record is still the
/// exact one that was read; otherwise the read is repeated, up to `retries`
/// extra times, before giving up with `RaceLost`. A record deleted between the
/// read and the write is never recreated.
pub(crate) fn cas_update<S, T, F, E>(
    store: &S,
    key: &str,
    retries: u32,
    ttl: E,
    mut update: F,
) -> CoordResult<CasOutcome<T>>
where
    S: Store + ?Sized,
    T: Serialize + DeserializeOwned,
    F: FnMut(&T) -> Option<T>,
    E: Fn(&T) -> Option<Duration>,
{
    for attempt in 0..=retries {
        let Some((raw, current)) = load_versioned::<S, T>(store, key)? else {
            return Ok(CasOutcome::Absent);
        };

        let Some(value) = update(&current.value) else {
            return Ok(CasOutcome::Unchanged(current.into_inner()));
        };

        let next = current.next(value);
        let encoded = encode(key, &next)?;
        if store.compare_and_set(key, Some(&raw), &encoded, ttl(&next.value))? {
            return Ok(CasOutcome::Updated(next.into_inner()));
        }

        debug!(key = %key, attempt, "compare-and-set lost, re-reading");
    }

    Err(CoordError::race_lost(key))
}
