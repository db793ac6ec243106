//! Per-user notification feed.
//!
//! Each notification is a versioned record under its own stable key; the
//! user's feed is a separate sorted set of ids scored by creation time. Read
//! state changes rewrite only the record (compare-and-swap), so a
//! notification never moves within the feed and concurrent updates cannot
//! duplicate or drop it.
//!
//! Every send is also published on the user's channel for live listeners.
//! That side-channel is fire-and-forget: nobody listening, or a failed
//! publish, loses the live copy but never the stored one.

use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use kvcoord_core::{
    Clock, CoordError, CoordResult, NotificationId, SystemClock, UserId, Versioned, unix_millis,
};
use kvcoord_store::{Store, Subscription};

use crate::config::NotificationConfig;
use crate::keys::KeySpace;
use crate::record::{CasOutcome, cas_update, decode, encode, load_versioned};

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    /// Opaque, caller-defined data.
    pub data: JsonValue,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// One page of a feed, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    /// Live notifications in the feed.
    pub total: u64,
    pub unread: u64,
    pub limit: usize,
    pub offset: usize,
}

/// Live notifications for one user.
///
/// Only notifications sent after the subscription was opened are seen.
#[derive(Debug)]
pub struct NotificationStream {
    inner: Subscription<String>,
}

impl NotificationStream {
    /// Block until the next notification. `None` once the stream is closed.
    pub fn recv(&self) -> Option<Notification> {
        loop {
            let payload = self.inner.recv().ok()?;
            if let Some(n) = parse_live(&payload) {
                return Some(n);
            }
        }
    }

    /// Next notification if one is already waiting.
    pub fn try_recv(&self) -> Result<Notification, TryRecvError> {
        loop {
            let payload = self.inner.try_recv()?;
            if let Some(n) = parse_live(&payload) {
                return Ok(n);
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Notification, RecvTimeoutError> {
        loop {
            let payload = self.inner.recv_timeout(timeout)?;
            if let Some(n) = parse_live(&payload) {
                return Ok(n);
            }
        }
    }
}

impl Iterator for NotificationStream {
    type Item = Notification;

    fn next(&mut self) -> Option<Notification> {
        self.recv()
    }
}

fn parse_live(payload: &str) -> Option<Notification> {
    match serde_json::from_str(payload) {
        Ok(n) => Some(n),
        Err(e) => {
            debug!(error = %e, "ignoring malformed live notification");
            None
        }
    }
}

/// Notification feed over a shared store.
#[derive(Debug, Clone)]
pub struct NotificationFeed<S: Store> {
    store: S,
    keys: KeySpace,
    config: NotificationConfig,
    clock: Arc<dyn Clock>,
}

impl<S: Store> NotificationFeed<S> {
    pub fn new(store: S, keys: KeySpace, config: NotificationConfig) -> Self {
        Self {
            store,
            keys,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record a notification and push it to live listeners.
    pub fn send(
        &self,
        user: UserId,
        kind: impl Into<String>,
        message: impl Into<String>,
        data: JsonValue,
    ) -> CoordResult<Notification> {
        let kind = kind.into();
        let message = message.into();
        if kind.is_empty() {
            return Err(CoordError::validation("notification type must not be empty"));
        }
        if message.is_empty() {
            return Err(CoordError::validation("notification message must not be empty"));
        }

        let now = self.clock.now();
        let notification = Notification {
            id: NotificationId::new(),
            user_id: user,
            kind,
            message,
            data,
            read: false,
            created_at: now,
        };

        let record_key = self.keys.notification_record(notification.id);
        let record = encode(&record_key, &Versioned::new(notification.clone()))?;
        self.store
            .set_ex(&record_key, &record, self.config.retention)?;

        let feed = self.keys.notification_feed(user);
        let now_ms = unix_millis(now);
        self.store
            .zadd(&feed, &notification.id.to_string(), now_ms as f64)?;
        self.store.expire(&feed, self.config.retention)?;
        self.store.zrem_range_by_score(
            &feed,
            f64::NEG_INFINITY,
            (now_ms - self.config.retention.as_millis() as i64) as f64,
        )?;

        let channel = self.keys.notification_channel(user);
        let live = encode(&channel, &notification)?;
        match self.store.publish(&channel, &live) {
            Ok(listeners) => {
                debug!(user_id = %user, notification_id = %notification.id, listeners, "notification sent")
            }
            Err(e) => {
                warn!(user_id = %user, notification_id = %notification.id, error = %e, "live notification publish failed")
            }
        }

        Ok(notification)
    }

    /// A page of the user's feed, newest first. With `only_unread` the filter
    /// applies before paging.
    pub fn list(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
        only_unread: bool,
    ) -> CoordResult<NotificationPage> {
        if limit == 0 || limit > self.config.max_page_size {
            return Err(CoordError::validation(format!(
                "limit must be between 1 and {}",
                self.config.max_page_size
            )));
        }

        let live = self.live(user)?;
        let total = live.len() as u64;
        let unread = live.iter().filter(|n| !n.read).count() as u64;
        let items = live
            .into_iter()
            .filter(|n| !only_unread || !n.read)
            .skip(offset)
            .take(limit)
            .collect();

        Ok(NotificationPage {
            items,
            total,
            unread,
            limit,
            offset,
        })
    }

    pub fn get(&self, user: UserId, id: NotificationId) -> CoordResult<Option<Notification>> {
        let key = self.keys.notification_record(id);
        Ok(load_versioned::<_, Notification>(&self.store, &key)?
            .map(|(_, record)| record.into_inner())
            .filter(|n| n.user_id == user))
    }

    /// Mark one notification read. `false` if it does not exist for `user`.
    pub fn mark_as_read(&self, user: UserId, id: NotificationId) -> CoordResult<bool> {
        let key = self.keys.notification_record(id);
        let outcome = cas_update(
            &self.store,
            &key,
            self.config.cas_retries,
            |n: &Notification| Some(self.remaining_retention(n)),
            |n: &Notification| {
                (n.user_id == user && !n.read).then(|| Notification {
                    read: true,
                    ..n.clone()
                })
            },
        )?;

        Ok(match outcome {
            CasOutcome::Updated(_) => true,
            CasOutcome::Unchanged(n) => n.user_id == user,
            CasOutcome::Absent => false,
        })
    }

    /// Mark every live notification read. Returns how many changed.
    pub fn mark_all_as_read(&self, user: UserId) -> CoordResult<usize> {
        let mut marked = 0;
        for n in self.live(user)?.into_iter().filter(|n| !n.read) {
            let key = self.keys.notification_record(n.id);
            let outcome = cas_update(
                &self.store,
                &key,
                self.config.cas_retries,
                |n: &Notification| Some(self.remaining_retention(n)),
                |n: &Notification| {
                    (!n.read).then(|| Notification {
                        read: true,
                        ..n.clone()
                    })
                },
            )?;
            if matches!(outcome, CasOutcome::Updated(_)) {
                marked += 1;
            }
        }

        debug!(user_id = %user, marked, "marked all notifications read");
        Ok(marked)
    }

    /// Remove a notification. `false` if it does not exist for `user`.
    pub fn delete(&self, user: UserId, id: NotificationId) -> CoordResult<bool> {
        let feed = self.keys.notification_feed(user);
        let key = self.keys.notification_record(id);

        match load_versioned::<_, Notification>(&self.store, &key)? {
            Some((_, record)) if record.value.user_id == user => {
                self.store.zrem(&feed, &id.to_string())?;
                self.store.del(&key)?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                self.store.zrem(&feed, &id.to_string())?;
                Ok(false)
            }
        }
    }

    pub fn count_unread(&self, user: UserId) -> CoordResult<u64> {
        Ok(self.live(user)?.iter().filter(|n| !n.read).count() as u64)
    }

    /// Listen for notifications sent to `user` from now on.
    pub fn subscribe(&self, user: UserId) -> CoordResult<NotificationStream> {
        let inner = self.store.subscribe(&self.keys.notification_channel(user))?;
        Ok(NotificationStream { inner })
    }

    /// Every live notification, newest first. Ids whose record has expired
    /// are dropped from the feed on the way.
    fn live(&self, user: UserId) -> CoordResult<Vec<Notification>> {
        let feed = self.keys.notification_feed(user);
        let members = self.store.zrevrange(&feed, 0, -1)?;

        let mut live = Vec::with_capacity(members.len());
        for member in members {
            let Ok(id) = member.parse::<NotificationId>() else {
                self.store.zrem(&feed, &member)?;
                continue;
            };
            let key = self.keys.notification_record(id);
            match self.store.get(&key)? {
                Some(raw) => {
                    let record: Versioned<Notification> = decode(&key, &raw)?;
                    if record.value.user_id == user {
                        live.push(record.into_inner());
                    }
                }
                None => {
                    self.store.zrem(&feed, &member)?;
                }
            }
        }
        Ok(live)
    }

    /// Time left until the record's original expiry.
    fn remaining_retention(&self, n: &Notification) -> Duration {
        let expires_at = n.created_at
            + chrono::Duration::milliseconds(self.config.retention.as_millis() as i64);
        (expires_at - self.clock.now())
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvcoord_core::ManualClock;
    use kvcoord_store::InMemoryStore;
    use serde_json::json;

    fn feed() -> (Arc<ManualClock>, Arc<InMemoryStore>, NotificationFeed<Arc<InMemoryStore>>) {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let feed = NotificationFeed::new(
            store.clone(),
            KeySpace::new("t"),
            NotificationConfig {
                retention: Duration::from_secs(3_600),
                max_page_size: 50,
                cas_retries: 3,
            },
        )
        .with_clock(clock.clone());
        (clock, store, feed)
    }

    fn send_n(
        clock: &ManualClock,
        feed: &NotificationFeed<Arc<InMemoryStore>>,
        user: UserId,
        n: usize,
    ) -> Vec<NotificationId> {
        (0..n)
            .map(|i| {
                clock.advance(Duration::from_secs(1));
                feed.send(user, "case.update", format!("update {i}"), json!({ "i": i }))
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[test]
    fn newest_notification_is_listed_first() {
        let (clock, _store, feed) = feed();
        let user = UserId::new();
        let ids = send_n(&clock, &feed, user, 3);

        let page = feed.list(user, 1, 0, false).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, ids[2]);
        assert_eq!(page.total, 3);
        assert_eq!(page.unread, 3);

        let rest: Vec<NotificationId> = feed
            .list(user, 10, 1, false)
            .unwrap()
            .items
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(rest, vec![ids[1], ids[0]]);
    }

    #[test]
    fn mark_as_read_keeps_feed_position() {
        let (clock, _store, feed) = feed();
        let user = UserId::new();
        let ids = send_n(&clock, &feed, user, 3);

        assert!(feed.mark_as_read(user, ids[1]).unwrap());
        assert!(feed.mark_as_read(user, ids[1]).unwrap());

        let page = feed.list(user, 10, 0, false).unwrap();
        let order: Vec<NotificationId> = page.items.iter().map(|n| n.id).collect();
        assert_eq!(order, vec![ids[2], ids[1], ids[0]]);
        assert!(page.items[1].read);
        assert_eq!(page.unread, 2);
        assert_eq!(feed.count_unread(user).unwrap(), 2);
    }

    #[test]
    fn mark_all_as_read_empties_unread_view() {
        let (clock, _store, feed) = feed();
        let user = UserId::new();
        send_n(&clock, &feed, user, 4);

        assert_eq!(feed.mark_all_as_read(user).unwrap(), 4);
        assert_eq!(feed.mark_all_as_read(user).unwrap(), 0);

        let page = feed.list(user, 10, 0, true).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.unread, 0);
        assert_eq!(page.total, 4);
    }

    #[test]
    fn unread_filter_applies_before_paging() {
        let (clock, _store, feed) = feed();
        let user = UserId::new();
        let ids = send_n(&clock, &feed, user, 4);
        feed.mark_as_read(user, ids[3]).unwrap();
        feed.mark_as_read(user, ids[2]).unwrap();

        let page = feed.list(user, 1, 1, true).unwrap();
        assert_eq!(page.items[0].id, ids[0]);
    }

    #[test]
    fn other_users_notifications_are_absent() {
        let (clock, _store, feed) = feed();
        let owner = UserId::new();
        let stranger = UserId::new();
        let id = send_n(&clock, &feed, owner, 1)[0];

        assert_eq!(feed.get(stranger, id).unwrap(), None);
        assert!(!feed.mark_as_read(stranger, id).unwrap());
        assert!(!feed.delete(stranger, id).unwrap());
        assert!(!feed.get(owner, id).unwrap().unwrap().read);
    }

    #[test]
    fn delete_removes_from_feed() {
        let (clock, _store, feed) = feed();
        let user = UserId::new();
        let ids = send_n(&clock, &feed, user, 2);

        assert!(feed.delete(user, ids[0]).unwrap());
        assert!(!feed.delete(user, ids[0]).unwrap());
        assert_eq!(feed.list(user, 10, 0, false).unwrap().total, 1);
        assert!(!feed.mark_as_read(user, ids[0]).unwrap());
    }

    #[test]
    fn expired_notifications_are_pruned() {
        let (clock, store, feed) = feed();
        let user = UserId::new();
        send_n(&clock, &feed, user, 1);
        clock.advance(Duration::from_secs(1_800));
        let fresh = send_n(&clock, &feed, user, 1)[0];

        clock.advance(Duration::from_secs(1_800));
        let page = feed.list(user, 10, 0, false).unwrap();
        assert_eq!(page.items.iter().map(|n| n.id).collect::<Vec<_>>(), vec![fresh]);
        assert_eq!(
            store
                .zcard(&KeySpace::new("t").notification_feed(user))
                .unwrap(),
            1
        );
    }

    #[test]
    fn marking_read_does_not_extend_retention() {
        let (clock, store, feed) = feed();
        let user = UserId::new();
        let id = send_n(&clock, &feed, user, 1)[0];

        clock.advance(Duration::from_secs(600));
        feed.mark_as_read(user, id).unwrap();
        assert_eq!(
            store.ttl(&KeySpace::new("t").notification_record(id)),
            Some(Duration::from_secs(3_000))
        );
    }

    #[test]
    fn send_reaches_live_subscribers() {
        let (_clock, _store, feed) = feed();
        let user = UserId::new();
        let stream = feed.subscribe(user).unwrap();
        let other = feed.subscribe(UserId::new()).unwrap();

        let sent = feed.send(user, "offer.received", "New offer", json!({})).unwrap();
        assert_eq!(stream.try_recv().unwrap(), sent);
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn send_without_listeners_still_stores() {
        let (_clock, _store, feed) = feed();
        let user = UserId::new();
        feed.send(user, "t", "m", JsonValue::Null).unwrap();
        assert_eq!(feed.count_unread(user).unwrap(), 1);
    }

    #[test]
    fn invalid_input_is_rejected() {
        let (_clock, _store, feed) = feed();
        let user = UserId::new();
        assert!(matches!(
            feed.send(user, "", "m", JsonValue::Null),
            Err(CoordError::Validation(_))
        ));
        assert!(matches!(
            feed.send(user, "t", "", JsonValue::Null),
            Err(CoordError::Validation(_))
        ));
        assert!(matches!(feed.list(user, 0, 0, false), Err(CoordError::Validation(_))));
        assert!(matches!(feed.list(user, 51, 0, false), Err(CoordError::Validation(_))));
    }
}
