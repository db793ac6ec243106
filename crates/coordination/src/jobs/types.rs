//! Job types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use kvcoord_core::{CoordError, CoordResult, JobId};

/// Tagged, opaque job payload.
///
/// The queue never looks inside `body`; `kind` is the job type that workers
/// dispatch on (e.g. `mail.welcome`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub kind: String,
    pub body: Vec<u8>,
}

impl JobPayload {
    pub fn new(kind: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            body: body.into(),
        }
    }

    /// A payload whose body is `value` encoded as JSON.
    pub fn json<T: Serialize>(kind: impl Into<String>, value: &T) -> CoordResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| CoordError::validation(format!("job payload: {e}")))?;
        Ok(Self::new(kind, body))
    }

    /// Decode a JSON body.
    pub fn parse_json<T: DeserializeOwned>(&self) -> CoordResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| CoordError::validation(format!("job payload {}: {e}", self.kind)))
    }
}

/// A queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: JobPayload,
    /// Number of times the job has been reserved.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dequeued.
    pub available_at: DateTime<Utc>,
    /// Set while a worker holds the reservation.
    pub reserved_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn kind(&self) -> &str {
        &self.payload.kind
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }
}

/// A job that failed terminally, kept for inspection and manual retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Result of running a job handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Terminal failure: the job moves to the failed store.
    Failure(String),
}

/// Sizes of one queue's structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub delayed: u64,
    pub ready: u64,
    pub reserved: u64,
}

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Expired reservations returned to the ready list.
    pub requeued: usize,
    /// Expired reservations whose attempt budget was spent.
    pub failed: usize,
}
