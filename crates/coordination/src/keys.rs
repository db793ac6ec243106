//! Store key layout.
//!
//! All keys share one prefix so that several deployments can share a store.

use kvcoord_core::{JobId, NotificationId, SessionId, UserId};

/// Key builder for a given prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // -- rate limiting --

    pub fn rate_limit(&self, endpoint: &str, identifier: &str) -> String {
        format!("{}:ratelimit:{endpoint}:{identifier}", self.prefix)
    }

    // -- jobs --

    /// Registry of every queue that has ever received a job.
    pub fn job_queues(&self) -> String {
        format!("{}:jobs:queues", self.prefix)
    }

    pub fn job_record(&self, id: JobId) -> String {
        format!("{}:jobs:record:{id}", self.prefix)
    }

    pub fn job_delayed(&self, queue: &str) -> String {
        format!("{}:jobs:{queue}:delayed", self.prefix)
    }

    pub fn job_ready(&self, queue: &str) -> String {
        format!("{}:jobs:{queue}:ready", self.prefix)
    }

    pub fn job_reserved(&self, queue: &str) -> String {
        format!("{}:jobs:{queue}:reserved", self.prefix)
    }

    /// Index of failed job ids, scored by failure time.
    pub fn jobs_failed(&self) -> String {
        format!("{}:jobs:failed", self.prefix)
    }

    pub fn failed_job_record(&self, id: JobId) -> String {
        format!("{}:jobs:failed:{id}", self.prefix)
    }

    // -- notifications --

    pub fn notification_feed(&self, user: UserId) -> String {
        format!("{}:notifications:feed:{user}", self.prefix)
    }

    pub fn notification_record(&self, id: NotificationId) -> String {
        format!("{}:notifications:record:{id}", self.prefix)
    }

    pub fn notification_channel(&self, user: UserId) -> String {
        format!("{}:notifications:channel:{user}", self.prefix)
    }

    // -- sessions --

    pub fn session_record(&self, id: SessionId) -> String {
        format!("{}:sessions:record:{id}", self.prefix)
    }

    pub fn user_sessions(&self, user: UserId) -> String {
        format!("{}:sessions:user:{user}", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("kvcoord")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_prefix() {
        let keys = KeySpace::new("app");
        let job = JobId::new();

        assert_eq!(keys.rate_limit("login", "10.0.0.1"), "app:ratelimit:login:10.0.0.1");
        assert_eq!(keys.job_ready("mail"), "app:jobs:mail:ready");
        assert_eq!(keys.job_record(job), format!("app:jobs:record:{job}"));
        assert_eq!(keys.failed_job_record(job), format!("app:jobs:failed:{job}"));
    }
}
