//! Delayed job queue with reservation, retry and dead-letter handling.
//!
//! ## Layout
//!
//! Per queue: a delayed sorted set (scored by `available_at`), a FIFO ready
//! list and a reserved sorted set (scored by reservation deadline). Job
//! records live under their own key; terminally failed jobs go to one global
//! failed index.
//!
//! ## Components
//!
//! - `JobQueue`: enqueue/dequeue/complete/fail/retry plus promotion and reaping
//! - `Worker`: handler registry and polling loop on a dedicated thread
//! - `Scheduler`: periodic promotion + reaping on a dedicated thread
//!
//! Delivery is at-least-once: handlers must be idempotent or deduplicate by
//! job id.

pub mod queue;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use queue::JobQueue;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats, TickReport};
pub use types::{FailedJob, Job, JobPayload, JobResult, QueueStats, ReclaimReport};
pub use worker::{JobHandler, Worker, WorkerConfig, WorkerHandle, WorkerStats};
