//! Periodic promotion of delayed jobs and reaping of expired reservations.
//!
//! Any number of schedulers may run at once, in any number of processes:
//! both steps claim each id with a single-member removal before moving it.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use kvcoord_core::CoordResult;
use kvcoord_store::Store;

use super::queue::JobQueue;

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            name: "kvcoord-scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub promoted: usize,
    pub requeued: usize,
    pub failed: usize,
}

/// Cumulative scheduler statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub promoted: u64,
    pub requeued: u64,
    pub failed: u64,
    pub errors: u64,
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Background driver for a [`JobQueue`].
#[derive(Debug)]
pub struct Scheduler<S: Store> {
    queue: JobQueue<S>,
}

impl<S: Store + 'static> Scheduler<S> {
    pub fn new(queue: JobQueue<S>) -> Self {
        Self { queue }
    }

    /// Promote due delayed jobs, then reclaim expired reservations.
    pub fn tick(&self) -> CoordResult<TickReport> {
        let promoted = self.queue.promote_delayed()?;
        let reclaimed = self.queue.reclaim_expired()?;
        Ok(TickReport {
            promoted,
            requeued: reclaimed.requeued,
            failed: reclaimed.failed,
        })
    }

    /// Spawn the tick loop in a background thread.
    pub fn spawn(self, config: SchedulerConfig) -> std::io::Result<SchedulerHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || scheduler_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn scheduler_loop<S: Store + 'static>(
    scheduler: Scheduler<S>,
    config: SchedulerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    info!(scheduler = %config.name, interval_ms = config.interval.as_millis() as u64, "scheduler started");

    loop {
        let outcome = scheduler.tick();

        {
            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.ticks += 1;
            match outcome {
                Ok(report) => {
                    s.promoted += report.promoted as u64;
                    s.requeued += report.requeued as u64;
                    s.failed += report.failed as u64;
                    if report != TickReport::default() {
                        debug!(scheduler = %config.name, ?report, "tick");
                    }
                }
                Err(e) => {
                    s.errors += 1;
                    error!(scheduler = %config.name, error = %e, "scheduler tick failed");
                }
            }
        }

        match shutdown_rx.recv_timeout(config.interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    info!(scheduler = %config.name, "scheduler stopped");
}
