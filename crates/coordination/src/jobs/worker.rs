//! Job worker: handler registry plus a polling loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use kvcoord_core::{CoordResult, JobId};
use kvcoord_store::Store;

use super::queue::JobQueue;
use super::types::{Job, JobResult};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues polled in round-robin order.
    pub queues: Vec<String>,
    /// Sleep between passes that found no work
    pub poll_interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            poll_interval: Duration::from_millis(100),
            name: "kvcoord-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown. The job in flight, if any, finishes first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

/// Background job worker.
///
/// Reserves jobs from its queues, runs the registered handler and reports the
/// outcome back to the queue: `Complete` on success, `Fail` otherwise. A worker
/// that dies mid-job leaves the reservation to expire; the reaper then hands
/// the job to someone else.
pub struct Worker<S: Store> {
    queue: JobQueue<S>,
    handlers: HashMap<String, JobHandler>,
}

impl<S: Store> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<&String> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("Worker").field("handlers", &patterns).finish()
    }
}

impl<S: Store + 'static> Worker<S> {
    pub fn new(queue: JobQueue<S>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job kind.
    ///
    /// Patterns: an exact kind (`mail.welcome`), a category (`mail.*`) or the
    /// wildcard `*`.
    pub fn register_handler<F>(&mut self, kind_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(kind_pattern.into(), Box::new(handler));
    }

    /// Get the handler for a job kind.
    fn handler_for(&self, kind: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(kind) {
            return Some(h);
        }

        // Most specific category wins ("mail.welcome.*" over "mail.*").
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = kind.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);
        if category.is_some() {
            return category;
        }

        self.handlers.get("*")
    }

    /// Reserve and run one job from `queue`.
    ///
    /// Returns the job id and what the handler decided, or `None` if the queue
    /// had nothing ready.
    pub fn process_one(&self, queue: &str) -> CoordResult<Option<(JobId, JobResult)>> {
        let Some(job) = self.queue.dequeue(queue)? else {
            return Ok(None);
        };

        let result = match self.handler_for(job.kind()) {
            Some(handler) => handler(&job),
            None => {
                let error = format!("no handler for job type: {}", job.kind());
                warn!(job_id = %job.id, error = %error, "no handler for job");
                JobResult::Failure(error)
            }
        };

        match &result {
            JobResult::Success => {
                self.queue.complete(job.id)?;
                debug!(job_id = %job.id, "job completed successfully");
            }
            JobResult::Failure(error) => {
                self.queue.fail(job.id, error.clone())?;
            }
        }

        Ok(Some((job.id, result)))
    }

    /// Spawn the worker in a background thread.
    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<WorkerHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                worker_loop(self, config, shutdown_rx, stats_clone);
            })?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop<S: Store + 'static>(
    worker: Worker<S>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, queues = ?config.queues, "job worker started");
    let start_time = Instant::now();

    loop {
        let mut did_work = false;

        for queue in &config.queues {
            let outcome = worker.process_one(queue);

            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.uptime_secs = start_time.elapsed().as_secs();
            match outcome {
                Ok(Some((_, JobResult::Success))) => {
                    did_work = true;
                    s.jobs_processed += 1;
                    s.jobs_succeeded += 1;
                }
                Ok(Some((job_id, JobResult::Failure(e)))) => {
                    did_work = true;
                    s.jobs_processed += 1;
                    s.jobs_failed += 1;
                    debug!(worker = %config.name, job_id = %job_id, error = %e, "job execution failed");
                }
                Ok(None) => {}
                Err(e) => {
                    s.store_errors += 1;
                    error!(worker = %config.name, queue = %queue, error = %e, "failed to process job");
                }
            }
        }

        // Drain the current queues before waiting; stop on request or when the
        // handle is gone.
        if did_work {
            match shutdown_rx.try_recv() {
                Err(mpsc::TryRecvError::Empty) => continue,
                _ => break,
            }
        }
        match shutdown_rx.recv_timeout(config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    info!(worker = %config.name, "job worker stopped");
}
