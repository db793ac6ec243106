//! Integration tests across components sharing one store.
//!
//! Verifies:
//! - Concurrent promoters/reapers move every job exactly once
//! - Concurrent rate-limit checks never over-admit
//! - Compare-and-swap updates neither lose nor resurrect records
//! - Scheduler → Worker → NotificationFeed pipeline end to end

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use serde_json::json;

    use kvcoord_core::{JobId, ManualClock, UserId, Versioned};
    use kvcoord_store::{InMemoryStore, Store, StoreResult, Subscription};

    use crate::config::{EndpointLimits, JobQueueConfig, NotificationConfig, SessionConfig};
    use crate::jobs::{
        JobPayload, JobQueue, JobResult, QueueStats, ReclaimReport, Scheduler, Worker,
    };
    use crate::keys::KeySpace;
    use crate::notifications::{Notification, NotificationFeed};
    use crate::ratelimit::RateLimiter;
    use crate::sessions::SessionRegistry;

    const THREADS: usize = 8;

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryStore>) {
        let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        (clock, store)
    }

    fn job_queue(clock: &Arc<ManualClock>, store: &Arc<InMemoryStore>) -> JobQueue<Arc<InMemoryStore>> {
        JobQueue::new(
            store.clone(),
            KeySpace::new("it"),
            JobQueueConfig {
                visibility_timeout: Duration::from_secs(30),
                max_attempts: 3,
                record_ttl: Duration::from_secs(3_600),
            },
        )
        .with_clock(clock.clone())
    }

    fn drain(queue: &JobQueue<Arc<InMemoryStore>>, name: &str) -> Vec<JobId> {
        std::iter::from_fn(|| queue.dequeue(name).unwrap().map(|j| j.id)).collect()
    }

    #[test]
    fn concurrent_promoters_never_push_twice() {
        let (clock, store) = setup();
        let queue = job_queue(&clock, &store);

        let enqueued: HashSet<JobId> = (0..250)
            .map(|_| {
                queue
                    .enqueue("mail", JobPayload::new("mail.digest", vec![]), Duration::from_secs(5))
                    .unwrap()
            })
            .collect();
        clock.advance(Duration::from_secs(5));

        let promoted: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| s.spawn(|| queue.promote_delayed().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(promoted, 250);
        let dequeued = drain(&queue, "mail");
        assert_eq!(dequeued.len(), 250);
        assert_eq!(dequeued.into_iter().collect::<HashSet<_>>(), enqueued);
    }

    #[test]
    fn concurrent_reapers_requeue_each_reservation_once() {
        let (clock, store) = setup();
        let queue = job_queue(&clock, &store);

        for _ in 0..120 {
            queue
                .enqueue("mail", JobPayload::new("mail.digest", vec![]), Duration::ZERO)
                .unwrap();
        }
        assert_eq!(drain(&queue, "mail").len(), 120);
        clock.advance(Duration::from_secs(30));

        let total = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| s.spawn(|| queue.reclaim_expired().unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .fold(ReclaimReport::default(), |acc, r| ReclaimReport {
                    requeued: acc.requeued + r.requeued,
                    failed: acc.failed + r.failed,
                })
        });

        assert_eq!(total, ReclaimReport { requeued: 120, failed: 0 });
        let redelivered = drain(&queue, "mail");
        assert_eq!(redelivered.len(), 120);
        assert_eq!(redelivered.iter().collect::<HashSet<_>>().len(), 120);
    }

    #[test]
    fn concurrent_checks_never_over_admit() {
        let (clock, store) = setup();
        let limiter = RateLimiter::new(store, KeySpace::new("it"), EndpointLimits::default())
            .with_clock(clock);

        let admitted: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..20)
                            .filter(|_| {
                                !limiter
                                    .check("upload", "shared", 25, Duration::from_secs(60))
                                    .unwrap()
                                    .limited
                            })
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert!(admitted <= 25, "admitted {admitted}");
        assert!(admitted > 0);
    }

    #[test]
    fn concurrent_mark_as_read_writes_once() {
        let (clock, store) = setup();
        let feed = NotificationFeed::new(store.clone(), KeySpace::new("it"), NotificationConfig::default())
            .with_clock(clock);
        let user = UserId::new();
        let sent = feed.send(user, "offer.received", "New offer", json!({})).unwrap();

        let results: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| s.spawn(|| feed.mark_as_read(user, sent.id).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.into_iter().all(|r| r));
        let raw = store
            .get(&KeySpace::new("it").notification_record(sent.id))
            .unwrap()
            .unwrap();
        let record: Versioned<Notification> = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.version, 2);
        assert!(record.value.read);
        assert_eq!(feed.list(user, 10, 0, false).unwrap().total, 1);
    }

    /// Store that deletes the target key right before the next compare-and-set,
    /// simulating an invalidation racing a refresh.
    #[derive(Debug)]
    struct DeleteBeforeSwap {
        inner: InMemoryStore,
        armed: AtomicBool,
    }

    impl Store for DeleteBeforeSwap {
        fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            self.inner.set(key, value)
        }
        fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.set_ex(key, value, ttl)
        }
        fn del(&self, key: &str) -> StoreResult<bool> {
            self.inner.del(key)
        }
        fn compare_and_set(
            &self,
            key: &str,
            expected: Option<&str>,
            value: &str,
            ttl: Option<Duration>,
        ) -> StoreResult<bool> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.del(key)?;
            }
            self.inner.compare_and_set(key, expected, value, ttl)
        }
        fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.expire(key, ttl)
        }
        fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
            self.inner.zadd(key, member, score)
        }
        fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.zrem(key, member)
        }
        fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
            self.inner.zrem_range_by_score(key, min, max)
        }
        fn zrange_with_scores(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<(String, f64)>> {
            self.inner.zrange_with_scores(key, start, stop)
        }
        fn zrevrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
            self.inner.zrevrange(key, start, stop)
        }
        fn zrange_by_score(&self, key: &str, min: f64, max: f64, limit: Option<usize>) -> StoreResult<Vec<String>> {
            self.inner.zrange_by_score(key, min, max, limit)
        }
        fn zcard(&self, key: &str) -> StoreResult<u64> {
            self.inner.zcard(key)
        }
        fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
            self.inner.zscore(key, member)
        }
        fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.sadd(key, member)
        }
        fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.srem(key, member)
        }
        fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
            self.inner.smembers(key)
        }
        fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
            self.inner.rpush(key, value)
        }
        fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.lpop(key)
        }
        fn llen(&self, key: &str) -> StoreResult<u64> {
            self.inner.llen(key)
        }
        fn publish(&self, channel: &str, message: &str) -> StoreResult<u64> {
            self.inner.publish(channel, message)
        }
        fn subscribe(&self, channel: &str) -> StoreResult<Subscription<String>> {
            self.inner.subscribe(channel)
        }
    }

    #[test]
    fn refresh_never_resurrects_an_invalidated_session() {
        let store = Arc::new(DeleteBeforeSwap {
            inner: InMemoryStore::new(),
            armed: AtomicBool::new(false),
        });
        let registry = SessionRegistry::new(store.clone(), KeySpace::new("it"), SessionConfig::default());
        let user = UserId::new();
        let session = registry
            .create_session(user, json!({}), "ua", "127.0.0.1")
            .unwrap();

        store.armed.store(true, Ordering::SeqCst);
        assert_eq!(registry.get_session(user, session.session_id).unwrap(), None);
        assert!(
            store
                .get(&KeySpace::new("it").session_record(session.session_id))
                .unwrap()
                .is_none()
        );
        assert!(registry.list_sessions(user).unwrap().is_empty());
    }

    #[test]
    fn delayed_job_flows_through_scheduler_and_worker_into_feed() {
        let (clock, store) = setup();
        let queue = job_queue(&clock, &store);
        let feed = Arc::new(
            NotificationFeed::new(store.clone(), KeySpace::new("it"), NotificationConfig::default())
                .with_clock(clock.clone()),
        );
        let user = UserId::new();
        let live = feed.subscribe(user).unwrap();

        queue
            .enqueue(
                "notify",
                JobPayload::json("notify.case_published", &json!({ "user": user, "case": 42 })).unwrap(),
                Duration::from_secs(30),
            )
            .unwrap();

        let mut worker = Worker::new(queue.clone());
        let handler_feed = feed.clone();
        worker.register_handler("notify.*", move |job| {
            let body: serde_json::Value = match job.payload.parse_json() {
                Ok(body) => body,
                Err(e) => return JobResult::Failure(e.to_string()),
            };
            match handler_feed.send(user, "case.published", "Your case is live", body) {
                Ok(_) => JobResult::Success,
                Err(e) => JobResult::Failure(e.to_string()),
            }
        });
        let scheduler = Scheduler::new(queue.clone());

        clock.advance(Duration::from_secs(10));
        assert_eq!(scheduler.tick().unwrap().promoted, 0);
        assert_eq!(worker.process_one("notify").unwrap(), None);

        clock.advance(Duration::from_secs(21));
        assert_eq!(scheduler.tick().unwrap().promoted, 1);
        let (_, result) = worker.process_one("notify").unwrap().unwrap();
        assert_eq!(result, JobResult::Success);

        let delivered = live.try_recv().unwrap();
        assert_eq!(delivered.data["case"], 42);
        let page = feed.list(user, 1, 0, true).unwrap();
        assert_eq!(page.items, vec![delivered]);
        assert_eq!(queue.stats("notify").unwrap(), QueueStats::default());
    }
}
