//! Runtime configuration.
//!
//! Everything has a working default; deployments override through environment
//! variables (see [`CoordConfig::from_env`]).

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kvcoord_core::{CoordError, CoordResult};

/// Limit and window for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Static endpoint → rule table.
///
/// Serialized as a flat JSON object; the `"default"` entry applies to any
/// endpoint without its own rule:
///
/// ```json
/// { "login": { "limit": 5, "window_secs": 60 }, "default": { "limit": 100, "window_secs": 60 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointLimits {
    rules: BTreeMap<String, RateLimitRule>,
}

impl EndpointLimits {
    pub const DEFAULT_ENDPOINT: &'static str = "default";
    const FALLBACK: RateLimitRule = RateLimitRule::new(100, 60);

    /// An empty table: every endpoint gets the built-in fallback rule.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    pub fn with_rule(mut self, endpoint: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(endpoint.into(), rule);
        self
    }

    /// Rule for `endpoint`, falling back to the `"default"` entry.
    pub fn rule(&self, endpoint: &str) -> RateLimitRule {
        self.rules
            .get(endpoint)
            .or_else(|| self.rules.get(Self::DEFAULT_ENDPOINT))
            .copied()
            .unwrap_or(Self::FALLBACK)
    }

    /// Overlay rules parsed from JSON on top of this table.
    pub fn merge_json(mut self, json: &str) -> CoordResult<Self> {
        let overrides: BTreeMap<String, RateLimitRule> = serde_json::from_str(json)
            .map_err(|e| CoordError::validation(format!("invalid rate limit table: {e}")))?;
        for (endpoint, rule) in &overrides {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(CoordError::validation(format!(
                    "rate limit for {endpoint} must have non-zero limit and window"
                )));
            }
        }
        self.rules.extend(overrides);
        Ok(self)
    }
}

impl Default for EndpointLimits {
    fn default() -> Self {
        Self::empty()
            .with_rule("login", RateLimitRule::new(5, 60))
            .with_rule("register", RateLimitRule::new(3, 3_600))
            .with_rule("password_reset", RateLimitRule::new(3, 3_600))
            .with_rule("upload", RateLimitRule::new(20, 60))
            .with_rule(Self::DEFAULT_ENDPOINT, Self::FALLBACK)
    }
}

/// Job queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueConfig {
    /// How long a reservation lasts before the reaper may redeliver the job.
    pub visibility_timeout: Duration,
    /// Reservations allowed before the reaper fails the job instead.
    pub max_attempts: u32,
    /// TTL of live job records (bounds leaked records). Failed snapshots do not expire.
    pub record_ttl: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_attempts: 3,
            record_ttl: Duration::from_secs(7 * 24 * 3_600),
        }
    }
}

/// Notification feed settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Rolling retention of feeds and records, refreshed on every send.
    pub retention: Duration,
    pub max_page_size: usize,
    /// Compare-and-swap attempts before giving up with `RaceLost`.
    pub cas_retries: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 24 * 3_600),
            max_page_size: 100,
            cas_retries: 3,
        }
    }
}

/// Session registry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Idle lifetime; every successful read restarts it.
    pub lifetime: Duration,
    pub cas_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(24 * 3_600),
            cas_retries: 3,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub rate_limits: EndpointLimits,
    pub jobs: JobQueueConfig,
    pub notifications: NotificationConfig,
    pub sessions: SessionConfig,
    pub scheduler_interval: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "kvcoord".to_string(),
            rate_limits: EndpointLimits::default(),
            jobs: JobQueueConfig::default(),
            notifications: NotificationConfig::default(),
            sessions: SessionConfig::default(),
            scheduler_interval: Duration::from_millis(1_000),
        }
    }
}

impl CoordConfig {
    /// Load from the process environment.
    ///
    /// | variable | default |
    /// |---|---|
    /// | `REDIS_URL` | `redis://localhost:6379` |
    /// | `KVCOORD_KEY_PREFIX` | `kvcoord` |
    /// | `KVCOORD_JOB_VISIBILITY_TIMEOUT_SECS` | `300` |
    /// | `KVCOORD_JOB_MAX_ATTEMPTS` | `3` |
    /// | `KVCOORD_JOB_RECORD_TTL_SECS` | `604800` |
    /// | `KVCOORD_NOTIFICATION_RETENTION_SECS` | `2592000` |
    /// | `KVCOORD_SESSION_LIFETIME_SECS` | `86400` |
    /// | `KVCOORD_SCHEDULER_INTERVAL_MS` | `1000` |
    /// | `KVCOORD_RATE_LIMITS` | JSON overlay on the built-in table |
    pub fn from_env() -> CoordResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoordResult<Self> {
        let defaults = Self::default();

        let redis_url = lookup("REDIS_URL").unwrap_or(defaults.redis_url);
        let key_prefix = lookup("KVCOORD_KEY_PREFIX").unwrap_or(defaults.key_prefix);
        if key_prefix.is_empty() {
            return Err(CoordError::validation("KVCOORD_KEY_PREFIX must not be empty"));
        }

        let rate_limits = match lookup("KVCOORD_RATE_LIMITS") {
            Some(json) => defaults.rate_limits.merge_json(&json)?,
            None => defaults.rate_limits,
        };

        let jobs = JobQueueConfig {
            visibility_timeout: secs(&lookup, "KVCOORD_JOB_VISIBILITY_TIMEOUT_SECS")?
                .unwrap_or(defaults.jobs.visibility_timeout),
            max_attempts: parse(&lookup, "KVCOORD_JOB_MAX_ATTEMPTS")?
                .unwrap_or(defaults.jobs.max_attempts),
            record_ttl: secs(&lookup, "KVCOORD_JOB_RECORD_TTL_SECS")?
                .unwrap_or(defaults.jobs.record_ttl),
        };
        if jobs.max_attempts == 0 {
            return Err(CoordError::validation("KVCOORD_JOB_MAX_ATTEMPTS must be at least 1"));
        }

        let notifications = NotificationConfig {
            retention: secs(&lookup, "KVCOORD_NOTIFICATION_RETENTION_SECS")?
                .unwrap_or(defaults.notifications.retention),
            ..defaults.notifications
        };

        let sessions = SessionConfig {
            lifetime: secs(&lookup, "KVCOORD_SESSION_LIFETIME_SECS")?
                .unwrap_or(defaults.sessions.lifetime),
            ..defaults.sessions
        };

        let scheduler_interval = parse::<u64>(&lookup, "KVCOORD_SCHEDULER_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.scheduler_interval);

        Ok(Self {
            redis_url,
            key_prefix,
            rate_limits,
            jobs,
            notifications,
            sessions,
            scheduler_interval,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> CoordResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CoordError::validation(format!("{name}={raw:?}: {e}"))),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> CoordResult<Option<Duration>> {
    match parse::<u64>(lookup, name)? {
        Some(0) => Err(CoordError::validation(format!("{name} must be positive"))),
        other => Ok(other.map(Duration::from_secs)),
    }
}
