//! Store-backed job queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use kvcoord_core::{Clock, CoordError, CoordResult, JobId, SystemClock, unix_millis};
use kvcoord_store::Store;

use super::types::{FailedJob, Job, JobPayload, QueueStats, ReclaimReport};
use crate::config::JobQueueConfig;
use crate::keys::KeySpace;
use crate::record::{decode, encode, load};

/// Ids moved per sorted-set scan; scans repeat until a short batch.
const CLAIM_BATCH: usize = 100;

/// Job queue over a shared store.
///
/// Ids move between structures by claim-then-push: the single-member removal
/// from the source sorted set succeeds for exactly one caller, and only that
/// caller pushes the id onward. Promotion, reaping and retry may therefore run
/// in any number of processes at once without duplicating a job.
#[derive(Debug, Clone)]
pub struct JobQueue<S: Store> {
    store: S,
    keys: KeySpace,
    config: JobQueueConfig,
    clock: Arc<dyn Clock>,
}

impl<S: Store> JobQueue<S> {
    pub fn new(store: S, keys: KeySpace, config: JobQueueConfig) -> Self {
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

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    /// Add a job. With a non-zero `delay` it waits in the delayed set until
    /// promoted; otherwise it is immediately ready.
    pub fn enqueue(&self, queue: &str, payload: JobPayload, delay: Duration) -> CoordResult<JobId> {
        validate_queue(queue)?;
        if payload.kind.is_empty() {
            return Err(CoordError::validation("job kind must not be empty"));
        }

        let now = self.clock.now();
        let job = Job {
            id: JobId::new(),
            queue: queue.to_string(),
            payload,
            attempts: 0,
            created_at: now,
            available_at: now + to_chrono(delay),
            reserved_at: None,
        };

        self.write_job(&job)?;
        self.store.sadd(&self.keys.job_queues(), queue)?;

        if delay.is_zero() {
            self.store.rpush(&self.keys.job_ready(queue), &job.id.to_string())?;
        } else {
            self.store.zadd(
                &self.keys.job_delayed(queue),
                &job.id.to_string(),
                unix_millis(job.available_at) as f64,
            )?;
        }

        info!(queue = %queue, job_id = %job.id, kind = %job.kind(), delay_ms = delay.as_millis() as u64, "job enqueued");
        Ok(job.id)
    }

    /// Move every due delayed job of every queue to its ready list.
    pub fn promote_delayed(&self) -> CoordResult<usize> {
        let now_ms = unix_millis(self.clock.now()) as f64;
        let mut promoted = 0;

        for queue in self.queues()? {
            let delayed = self.keys.job_delayed(&queue);
            let ready = self.keys.job_ready(&queue);

            loop {
                let due = self
                    .store
                    .zrange_by_score(&delayed, f64::NEG_INFINITY, now_ms, Some(CLAIM_BATCH))?;

                for id in &due {
                    if self.store.zrem(&delayed, id)? {
                        self.store.rpush(&ready, id)?;
                        promoted += 1;
                    }
                }

                if due.len() < CLAIM_BATCH {
                    break;
                }
            }
        }

        if promoted > 0 {
            debug!(promoted, "promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Reserve the next ready job of `queue`.
    ///
    /// Ids whose record has expired are discarded. The reservation lasts for
    /// the visibility timeout; after that the reaper may hand the job to
    /// another worker.
    pub fn dequeue(&self, queue: &str) -> CoordResult<Option<Job>> {
        validate_queue(queue)?;
        let ready = self.keys.job_ready(queue);

        while let Some(raw_id) = self.store.lpop(&ready)? {
            let Ok(id) = raw_id.parse::<JobId>() else {
                warn!(queue = %queue, member = %raw_id, "discarding malformed job id");
                continue;
            };

            let key = self.keys.job_record(id);
            let Some(raw) = self.store.get(&key)? else {
                warn!(queue = %queue, job_id = %id, "discarding job without record");
                continue;
            };

            let mut job: Job = decode(&key, &raw)?;
            let now = self.clock.now();
            job.attempts += 1;
            job.reserved_at = Some(now);

            let deadline = now + to_chrono(self.config.visibility_timeout);
            self.store.zadd(
                &self.keys.job_reserved(queue),
                &id.to_string(),
                unix_millis(deadline) as f64,
            )?;

            let updated = encode(&key, &job)?;
            if !self
                .store
                .compare_and_set(&key, Some(&raw), &updated, Some(self.config.record_ttl))?
            {
                // Completed or failed while it sat in the ready list.
                self.store.zrem(&self.keys.job_reserved(queue), &id.to_string())?;
                warn!(queue = %queue, job_id = %id, "job changed while being reserved, skipping");
                continue;
            }

            debug!(queue = %queue, job_id = %id, attempts = job.attempts, "job reserved");
            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Finish a job. Returns whether there was anything left to remove.
    pub fn complete(&self, id: JobId) -> CoordResult<bool> {
        let key = self.keys.job_record(id);
        let Some(job) = load::<_, Job>(&self.store, &key)? else {
            return Ok(false);
        };

        let unreserved = self
            .store
            .zrem(&self.keys.job_reserved(&job.queue), &id.to_string())?;
        let deleted = self.store.del(&key)?;

        debug!(queue = %job.queue, job_id = %id, "job completed");
        Ok(unreserved || deleted)
    }

    /// Move a reserved job to the failed store.
    ///
    /// The reservation is claimed first, so only a job currently reserved can
    /// fail. `None` if the job is unknown or no longer reserved (the reaper
    /// handed it back, or another caller already finished it).
    pub fn fail(&self, id: JobId, error: impl Into<String>) -> CoordResult<Option<FailedJob>> {
        let key = self.keys.job_record(id);
        let Some(job) = load::<_, Job>(&self.store, &key)? else {
            return Ok(None);
        };

        if !self
            .store
            .zrem(&self.keys.job_reserved(&job.queue), &id.to_string())?
        {
            debug!(queue = %job.queue, job_id = %id, "job not reserved, fail ignored");
            return Ok(None);
        }

        let failed = self.bury(job, error.into(), self.clock.now())?;
        Ok(Some(failed))
    }

    /// Return a failed job to its ready list with a fresh attempt budget.
    pub fn retry_failed(&self, id: JobId) -> CoordResult<Option<Job>> {
        let member = id.to_string();
        if !self.store.zrem(&self.keys.jobs_failed(), &member)? {
            return Ok(None);
        }

        let failed_key = self.keys.failed_job_record(id);
        let Some(failed) = load::<_, FailedJob>(&self.store, &failed_key)? else {
            warn!(job_id = %id, "failed index pointed at a missing record");
            return Ok(None);
        };

        let now = self.clock.now();
        let job = Job {
            attempts: 0,
            available_at: now,
            reserved_at: None,
            ..failed.job
        };

        self.write_job(&job)?;
        self.store.sadd(&self.keys.job_queues(), &job.queue)?;
        self.store.rpush(&self.keys.job_ready(&job.queue), &member)?;
        self.store.del(&failed_key)?;

        info!(queue = %job.queue, job_id = %id, "failed job retried");
        Ok(Some(job))
    }

    /// Failed jobs, newest failure first.
    pub fn list_failed(&self, limit: usize, offset: usize) -> CoordResult<Vec<FailedJob>> {
        if limit == 0 {
            return Err(CoordError::validation("limit must be at least 1"));
        }

        let out_of_range = || CoordError::validation("offset out of range");
        let start = isize::try_from(offset).map_err(|_| out_of_range())?;
        let stop = offset
            .checked_add(limit - 1)
            .and_then(|stop| isize::try_from(stop).ok())
            .ok_or_else(out_of_range)?;

        let index = self.keys.jobs_failed();
        let ids = self.store.zrevrange(&index, start, stop)?;

        let mut jobs = Vec::with_capacity(ids.len());
        for member in ids {
            let Ok(id) = member.parse::<JobId>() else {
                self.store.zrem(&index, &member)?;
                continue;
            };
            match load::<_, FailedJob>(&self.store, &self.keys.failed_job_record(id))? {
                Some(failed) => jobs.push(failed),
                None => {
                    self.store.zrem(&index, &member)?;
                }
            }
        }
        Ok(jobs)
    }

    pub fn get(&self, id: JobId) -> CoordResult<Option<Job>> {
        load(&self.store, &self.keys.job_record(id))
    }

    pub fn get_failed(&self, id: JobId) -> CoordResult<Option<FailedJob>> {
        load(&self.store, &self.keys.failed_job_record(id))
    }

    /// Drop a failed job for good.
    pub fn delete_failed(&self, id: JobId) -> CoordResult<bool> {
        let unindexed = self.store.zrem(&self.keys.jobs_failed(), &id.to_string())?;
        let deleted = self.store.del(&self.keys.failed_job_record(id))?;
        Ok(unindexed || deleted)
    }

    /// Hand expired reservations back to the ready list, or fail jobs whose
    /// attempt budget is spent.
    pub fn reclaim_expired(&self) -> CoordResult<ReclaimReport> {
        let now = self.clock.now();
        let now_ms = unix_millis(now) as f64;
        let mut report = ReclaimReport::default();

        for queue in self.queues()? {
            let reserved = self.keys.job_reserved(&queue);

            loop {
                let expired = self
                    .store
                    .zrange_by_score(&reserved, f64::NEG_INFINITY, now_ms, Some(CLAIM_BATCH))?;

                for member in &expired {
                    if !self.store.zrem(&reserved, member)? {
                        continue;
                    }
                    let Ok(id) = member.parse::<JobId>() else {
                        continue;
                    };
                    self.reclaim(&queue, id, now, &mut report)?;
                }

                if expired.len() < CLAIM_BATCH {
                    break;
                }
            }
        }

        if report.requeued > 0 || report.failed > 0 {
            info!(requeued = report.requeued, failed = report.failed, "reclaimed expired reservations");
        }
        Ok(report)
    }

    /// Sizes of one queue's delayed set, ready list and reserved set.
    pub fn stats(&self, queue: &str) -> CoordResult<QueueStats> {
        validate_queue(queue)?;
        Ok(QueueStats {
            delayed: self.store.zcard(&self.keys.job_delayed(queue))?,
            ready: self.store.llen(&self.keys.job_ready(queue))?,
            reserved: self.store.zcard(&self.keys.job_reserved(queue))?,
        })
    }

    pub fn failed_count(&self) -> CoordResult<u64> {
        Ok(self.store.zcard(&self.keys.jobs_failed())?)
    }

    /// Names of every queue that has received a job.
    pub fn queues(&self) -> CoordResult<Vec<String>> {
        Ok(self.store.smembers(&self.keys.job_queues())?)
    }

    /// Handle one reservation this caller has already claimed.
    fn reclaim(
        &self,
        queue: &str,
        id: JobId,
        now: DateTime<Utc>,
        report: &mut ReclaimReport,
    ) -> CoordResult<()> {
        let key = self.keys.job_record(id);
        let Some(raw) = self.store.get(&key)? else {
            // Completed between the deadline and now.
            return Ok(());
        };
        let job: Job = decode(&key, &raw)?;

        if job.attempts >= self.config.max_attempts {
            let error = format!("visibility timeout exceeded after {} attempts", job.attempts);
            warn!(queue = %queue, job_id = %id, attempts = job.attempts, "job exhausted its attempts");
            self.bury(job, error, now)?;
            report.failed += 1;
            return Ok(());
        }

        let released = Job {
            reserved_at: None,
            ..job
        };
        let updated = encode(&key, &released)?;
        if self
            .store
            .compare_and_set(&key, Some(&raw), &updated, Some(self.config.record_ttl))?
        {
            self.store.rpush(&self.keys.job_ready(queue), &id.to_string())?;
            debug!(queue = %queue, job_id = %id, attempts = released.attempts, "reservation expired, job requeued");
            report.requeued += 1;
        }
        Ok(())
    }

    /// Snapshot a job into the failed store and drop its record.
    ///
    /// The caller must already hold the job's reservation claim.
    fn bury(&self, job: Job, error: String, now: DateTime<Utc>) -> CoordResult<FailedJob> {
        let id = job.id;
        let member = id.to_string();
        let failed = FailedJob {
            job,
            error,
            failed_at: now,
        };

        let failed_key = self.keys.failed_job_record(id);
        self.store.set(&failed_key, &encode(&failed_key, &failed)?)?;
        self.store
            .zadd(&self.keys.jobs_failed(), &member, unix_millis(now) as f64)?;

        let queue = &failed.job.queue;
        self.store.del(&self.keys.job_record(id))?;

        warn!(queue = %queue, job_id = %id, error = %failed.error, "job failed");
        Ok(failed)
    }

    fn write_job(&self, job: &Job) -> CoordResult<()> {
        let key = self.keys.job_record(job.id);
        self.store
            .set_ex(&key, &encode(&key, job)?, self.config.record_ttl)?;
        Ok(())
    }
}

fn validate_queue(queue: &str) -> CoordResult<()> {
    if queue.is_empty() || queue.contains(':') || queue.contains(char::is_whitespace) {
        return Err(CoordError::validation(format!("invalid queue name: {queue:?}")));
    }
    Ok(())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}
