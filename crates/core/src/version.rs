//! Optimistic versioning for mutable store records.
//!
//! A mutable record (notification, session) is stored together with a
//! monotonically increasing version. A writer replaces the record only if the
//! stored bytes still equal the bytes it read; because the version is part of
//! those bytes, two writers starting from the same version cannot both win.

use serde::{Deserialize, Serialize};

/// A record plus its monotonic version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

impl<T> Versioned<T> {
    /// First version of a freshly created record.
    pub fn new(value: T) -> Self {
        Self { version: 1, value }
    }

    /// Successor record carrying `value`.
    pub fn next(&self, value: T) -> Self {
        Self {
            version: self.version + 1,
            value,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}
