//! `kvcoord-coordination`: coordination primitives over a shared [`Store`].
//!
//! - [`RateLimiter`]: sliding-window request counting per (endpoint, identifier)
//! - [`JobQueue`]: delayed/ready/reserved/failed job lifecycle, plus the
//!   [`Worker`] and [`Scheduler`] background drivers
//! - [`NotificationFeed`]: per-user paginated feed with read state and live fan-out
//! - [`SessionRegistry`]: sliding-expiry sessions with a per-user index
//!
//! Every component takes its store and clock by injection. None of them spawns
//! threads or holds locks; multi-step sequences stay correct under concurrent
//! callers in other processes (claim-by-removal, record-then-verify, or
//! compare-and-swap of versioned records).
//!
//! [`Store`]: kvcoord_store::Store

pub mod config;
pub mod jobs;
pub mod keys;
pub mod notifications;
pub mod ratelimit;
mod record;
pub mod sessions;

mod integration_tests;

pub use config::{
    CoordConfig, EndpointLimits, JobQueueConfig, NotificationConfig, RateLimitRule, SessionConfig,
};
pub use jobs::{
    FailedJob, Job, JobHandler, JobPayload, JobQueue, JobResult, QueueStats, ReclaimReport,
    Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats, TickReport, Worker,
    WorkerConfig, WorkerHandle, WorkerStats,
};
pub use keys::KeySpace;
pub use notifications::{Notification, NotificationFeed, NotificationPage, NotificationStream};
pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use sessions::{Session, SessionRegistry};
