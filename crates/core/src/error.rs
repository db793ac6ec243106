//! Coordination error model.

use thiserror::Error;

/// Result type used across the coordination layer.
pub type CoordResult<T> = Result<T, CoordError>;

/// Coordination-level error.
///
/// Absence (unknown job, expired session, deleted notification) is not an
/// error: operations report it through `Option`/`bool` return values.
/// Rate-limit denial is not an error either.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// The store could not be reached or rejected a command.
    ///
    /// The caller owns retry/backoff.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Caller input was malformed. Raised before any store access.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An optimistic update collided with a concurrent writer.
    ///
    /// The whole operation may be retried.
    #[error("race lost on key {key}")]
    RaceLost { key: String },

    /// A stored record could not be decoded.
    #[error("corrupted record at {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

impl CoordError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn race_lost(key: impl Into<String>) -> Self {
        Self::RaceLost { key: key.into() }
    }

    pub fn corrupted(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupted {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::RaceLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CoordError::store("connection refused").is_retryable());
        assert!(CoordError::race_lost("k").is_retryable());
        assert!(!CoordError::validation("empty queue name").is_retryable());
        assert!(!CoordError::corrupted("k", "eof").is_retryable());
    }

    #[test]
    fn display_includes_key() {
        let err = CoordError::race_lost("app:notifications:record:1");
        assert_eq!(err.to_string(), "race lost on key app:notifications:record:1");
    }
}
