//! `kvcoord-core`: shared building blocks for the coordination primitives.
//!
//! This crate contains **pure** types only (no store access): identifiers, the
//! error taxonomy, the clock abstraction and optimistic record versioning.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock, from_unix_millis, unix_millis};
pub use error::{CoordError, CoordResult};
pub use id::{JobId, NotificationId, SessionId, UserId};
pub use version::Versioned;
